//! Remote client: thin request layer over the archive's `/api/v1/` REST
//! surface. Every operation sets the `Authorization: ApiKey
//! <username>:<apikey>` header and maps non-2xx responses to `RemoteError`.
//!
//! Each client owns a single scoped `reqwest::Client` with a bounded
//! request timeout, and every call goes through typed JSON request/response
//! structs.

pub mod dto;
pub mod error;

use dto::*;
use error::RemoteError;
use log::debug;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserDto>, RemoteError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserDto>, RemoteError>;
    async fn get_groups_for_user(&self, user_id: i64) -> Result<Vec<GroupDto>, RemoteError>;
    async fn get_facilities_for_user(&self, user_id: i64) -> Result<Vec<FacilityDto>, RemoteError>;
    async fn get_instrument_by_facility_and_name(
        &self,
        facility_id: i64,
        name: &str,
    ) -> Result<Option<InstrumentDto>, RemoteError>;
    async fn create_instrument(&self, facility_id: i64, name: &str) -> Result<InstrumentDto, RemoteError>;
    async fn rename_instrument(&self, instrument_id: i64, new_name: &str) -> Result<(), RemoteError>;
    async fn get_or_create_experiment_for_folder(
        &self,
        title: &str,
        instrument_id: i64,
    ) -> Result<ExperimentDto, RemoteError>;
    async fn create_dataset_if_necessary(
        &self,
        experiment_id: i64,
        description: &str,
    ) -> Result<DatasetDto, RemoteError>;
    async fn lookup_datafile_by_fingerprint(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest: &str,
    ) -> Result<Vec<DatafileDto>, RemoteError>;
    async fn create_datafile_bulk(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest_md5: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteError>;
    async fn create_datafile_staged(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest_sha512: &str,
    ) -> Result<StagedDatafileResponse, RemoteError>;
    async fn request_staging_access(&self) -> Result<StagingAccessResponse, RemoteError>;
}

/// Production `RemoteClient` backed by `reqwest`.
pub struct HttpRemoteClient {
    base_url: String,
    username: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(base_url: String, username: String, api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpRemoteClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            api_key,
            http,
        })
    }

    fn auth_header(&self) -> String {
        format!("ApiKey {}:{}", self.username, self.api_key)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/api/v1/{}/", self.base_url, resource)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, RemoteError> {
        debug!(
            "[PHASE: remote] [STEP: get] {} (auth={})",
            resource,
            crate::logging::mask_api_key_header(&self.username, &self.api_key)
        );
        let resp = self
            .http
            .get(self.url(resource))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(Some(resp.json::<T>().await?))
    }

    async fn post_json<B: serde::Serialize + Sync, T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        debug!("[PHASE: remote] [STEP: post] {}", resource);
        let resp = self
            .http
            .post(self.url(resource))
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserDto>, RemoteError> {
        self.get_json("user", &[("username", username.to_string())]).await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserDto>, RemoteError> {
        self.get_json("user", &[("email__iexact", email.to_string())]).await
    }

    async fn get_groups_for_user(&self, user_id: i64) -> Result<Vec<GroupDto>, RemoteError> {
        Ok(self
            .get_json::<Vec<GroupDto>>("group", &[("user", user_id.to_string())])
            .await?
            .unwrap_or_default())
    }

    async fn get_facilities_for_user(&self, user_id: i64) -> Result<Vec<FacilityDto>, RemoteError> {
        Ok(self
            .get_json::<Vec<FacilityDto>>("facility", &[("manager", user_id.to_string())])
            .await?
            .unwrap_or_default())
    }

    async fn get_instrument_by_facility_and_name(
        &self,
        facility_id: i64,
        name: &str,
    ) -> Result<Option<InstrumentDto>, RemoteError> {
        self.get_json(
            "instrument",
            &[("facility", facility_id.to_string()), ("name", name.to_string())],
        )
        .await
    }

    async fn create_instrument(&self, facility_id: i64, name: &str) -> Result<InstrumentDto, RemoteError> {
        self.post_json(
            "instrument",
            &CreateInstrumentRequest {
                name,
                facility: facility_id,
            },
        )
        .await
    }

    async fn rename_instrument(&self, instrument_id: i64, new_name: &str) -> Result<(), RemoteError> {
        let resp = self
            .http
            .put(format!("{}/api/v1/instrument/{}/", self.base_url, instrument_id))
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(&RenameInstrumentRequest { name: new_name })
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(())
    }

    async fn get_or_create_experiment_for_folder(
        &self,
        title: &str,
        instrument_id: i64,
    ) -> Result<ExperimentDto, RemoteError> {
        self.post_json(
            "experiment",
            &GetOrCreateExperimentRequest {
                title,
                instrument: instrument_id,
            },
        )
        .await
    }

    async fn create_dataset_if_necessary(
        &self,
        experiment_id: i64,
        description: &str,
    ) -> Result<DatasetDto, RemoteError> {
        self.post_json(
            "dataset",
            &CreateDatasetRequest {
                description,
                experiment: experiment_id,
            },
        )
        .await
    }

    async fn lookup_datafile_by_fingerprint(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest: &str,
    ) -> Result<Vec<DatafileDto>, RemoteError> {
        let resp: Option<DatafileLookupResponse> = self
            .get_json(
                "dataset_file",
                &[
                    ("dataset", dataset_id.to_string()),
                    ("filename", file_name.to_string()),
                    ("size", size.to_string()),
                    ("sha512sum", digest.to_string()),
                ],
            )
            .await?;
        Ok(resp.map(|r| r.objects).unwrap_or_default())
    }

    async fn create_datafile_bulk(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest_md5: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let part = reqwest::multipart::Part::bytes(body).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("dataset", dataset_id.to_string())
            .text("filename", file_name.to_string())
            .text("size", size.to_string())
            .text("md5sum", digest_md5.to_string())
            .part("attached_file", part);

        let resp = self
            .http
            .post(self.url("dataset_file"))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(())
    }

    async fn create_datafile_staged(
        &self,
        dataset_id: i64,
        file_name: &str,
        size: u64,
        digest_sha512: &str,
    ) -> Result<StagedDatafileResponse, RemoteError> {
        self.post_json(
            "dataset_file",
            &CreateDatafileStagedRequest {
                dataset: dataset_id,
                filename: file_name,
                size,
                sha512sum: digest_sha512,
            },
        )
        .await
    }

    async fn request_staging_access(&self) -> Result<StagingAccessResponse, RemoteError> {
        match self.get_json::<StagingAccessResponse>("mydata_uploader", &[]).await? {
            Some(resp) => Ok(resp),
            None => Err(RemoteError::DoesNotExist),
        }
    }
}

/// Bounded "am I online?" probe.
pub async fn is_online(base_url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    client.get(base_url).send().await.is_ok()
}
