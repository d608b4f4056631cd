//! Typed errors raised while walking the data directory and matching it
//! against the configured folder-structure template.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("InvalidFolderStructure: {0}")]
    InvalidFolderStructure(String),
    #[error("invalid glob pattern in {path:?}: {source}")]
    InvalidGlob { path: String, #[source] source: regex::Error },
}
