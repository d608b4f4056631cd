//! Immutable settings snapshot loaded once at run start.
//!
//! The on-disk file is a plain key/value `MyData` section (INI format,
//! `MyData.cfg`). `MYDATA_<UPPER_SNAKE_KEY>` environment variables override
//! any matching field after the file is loaded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum FolderStructure {
    UsernameDataset,
    EmailDataset,
    UsernameExperimentDataset,
    UsernameMyTardisExperimentDataset,
    UserGroupInstrumentResearcherDataset,
}

impl Default for FolderStructure {
    fn default() -> Self {
        FolderStructure::UsernameDataset
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub instrument_name: String,
    pub facility_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub data_directory: String,
    pub mytardis_url: String,
    pub username: String,
    pub api_key: String,

    pub folder_structure: FolderStructure,
    pub dataset_grouping: String,
    pub group_prefix: String,

    pub ignore_old_datasets: bool,
    pub ignore_interval_number: u32,
    pub ignore_interval_unit: String,
    pub ignore_new_files: bool,
    pub ignore_new_files_minutes: u32,

    pub use_includes_file: bool,
    pub includes_file: String,
    pub use_excludes_file: bool,
    pub excludes_file: String,

    pub max_verification_threads: usize,
    pub max_upload_threads: usize,
    pub cipher: String,
    pub use_none_cipher: bool,
    pub progress_poll_interval_secs: f64,

    pub start_automatically_on_login: bool,

    pub ssh_private_key_path: String,
    pub ssh_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            instrument_name: String::new(),
            facility_name: String::new(),
            contact_name: String::new(),
            contact_email: String::new(),
            data_directory: String::new(),
            mytardis_url: String::new(),
            username: String::new(),
            api_key: String::new(),
            folder_structure: FolderStructure::default(),
            dataset_grouping: String::new(),
            group_prefix: String::new(),
            ignore_old_datasets: false,
            ignore_interval_number: 0,
            ignore_interval_unit: "months".to_string(),
            ignore_new_files: true,
            ignore_new_files_minutes: 5,
            use_includes_file: false,
            includes_file: String::new(),
            use_excludes_file: false,
            excludes_file: String::new(),
            max_verification_threads: 5,
            max_upload_threads: 5,
            cipher: "aes128-ctr".to_string(),
            use_none_cipher: false,
            progress_poll_interval_secs: 1.0,
            start_automatically_on_login: false,
            ssh_private_key_path: String::new(),
            ssh_port: 22,
        }
    }
}

impl Settings {
    /// Load the immutable settings snapshot from an INI-format file under the
    /// `MyData` section, with `MYDATA_*` environment overrides.
    pub fn load(path: &Path) -> Result<Settings> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini).required(true))
            .add_source(config::Environment::with_prefix("MYDATA").separator("_"));

        let config = builder
            .build()
            .with_context(|| format!("failed to load settings from {:?}", path))?;

        // The INI section header wraps every key under "MyData.<key>"; try
        // that namespace first, then fall back to flat keys for callers that
        // hand-author a sectionless file (e.g. tests).
        let settings: Settings = config
            .clone()
            .try_deserialize::<SectionedSettings>()
            .map(|s| s.mydata)
            .or_else(|_| config.try_deserialize::<Settings>())
            .with_context(|| format!("failed to parse settings from {:?}", path))?;
        Ok(settings)
    }

    /// Pure validation: returns the name of the first required field that
    /// is blank, or `None` if all are present.
    pub fn required_field_is_blank(&self) -> Option<&'static str> {
        if self.instrument_name.trim().is_empty() {
            return Some("instrument_name");
        }
        if self.facility_name.trim().is_empty() {
            return Some("facility_name");
        }
        if self.contact_name.trim().is_empty() {
            return Some("contact_name");
        }
        if self.contact_email.trim().is_empty() {
            return Some("contact_email");
        }
        if self.data_directory.trim().is_empty() {
            return Some("data_directory");
        }
        if self.mytardis_url.trim().is_empty() {
            return Some("mytardis_url");
        }
        if self.username.trim().is_empty() {
            return Some("username");
        }
        if self.api_key.trim().is_empty() {
            return Some("api_key");
        }
        None
    }

    pub fn data_directory_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    pub fn cache_file_path(&self) -> PathBuf {
        self.data_directory_path()
            .join("mytardis_verified_files_cache.db")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SectionedSettings {
    #[serde(rename = "MyData")]
    mydata: Settings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("MyData.cfg");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", body).unwrap();
        path
    }

    #[test]
    fn load_parses_sectioned_ini() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(
            &dir,
            "[MyData]\n\
             instrument_name = Microscope1\n\
             facility_name = Facility\n\
             contact_name = Alice\n\
             contact_email = alice@example.com\n\
             data_directory = /data\n\
             mytardis_url = https://example.com\n\
             username = alice\n\
             api_key = secret\n\
             max_verification_threads = 8\n",
        );
        let settings = Settings::load(&path).expect("should load");
        assert_eq!(settings.instrument_name, "Microscope1");
        assert_eq!(settings.max_verification_threads, 8);
        assert!(settings.required_field_is_blank().is_none());
    }

    #[test]
    fn required_field_is_blank_reports_first_missing_field() {
        let settings = Settings::default();
        assert_eq!(settings.required_field_is_blank(), Some("instrument_name"));
    }
}
