//! Wire DTOs for the archive's `/api/v1/` REST surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct UserDto {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupDto {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilityDto {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentDto {
    pub id: i64,
    pub name: String,
    pub facility: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateInstrumentRequest<'a> {
    pub name: &'a str,
    pub facility: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameInstrumentRequest<'a> {
    pub name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentDto {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetOrCreateExperimentRequest<'a> {
    pub title: &'a str,
    pub instrument: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDto {
    pub id: i64,
    pub description: String,
    pub experiment: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDatasetRequest<'a> {
    pub description: &'a str,
    pub experiment: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatafileLookupResponse {
    pub objects: Vec<DatafileDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatafileDto {
    pub id: i64,
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub staged: bool,
    #[serde(default)]
    pub staged_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDatafileBulkRequest<'a> {
    pub dataset: i64,
    pub filename: &'a str,
    pub size: u64,
    pub md5sum: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDatafileStagedRequest<'a> {
    pub dataset: i64,
    pub filename: &'a str,
    pub size: u64,
    pub sha512sum: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagedDatafileResponse {
    pub staging_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagingAccessResponse {
    pub approved: bool,
}
