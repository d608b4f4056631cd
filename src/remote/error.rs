//! Typed remote-client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("unauthorized: check username/api_key")]
    Unauthorized,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("resource does not exist")]
    DoesNotExist,
    #[error("server schema is incompatible with this agent")]
    IncompatibleVersion,
    #[error("http error {status}: {body}")]
    HttpError { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RemoteError {
    pub fn from_status(status: reqwest::StatusCode, body: String) -> RemoteError {
        match status.as_u16() {
            401 => RemoteError::Unauthorized,
            404 => RemoteError::DoesNotExist,
            409 => RemoteError::DuplicateKey,
            _ => RemoteError::HttpError {
                status: status.as_u16(),
                body,
            },
        }
    }

    /// Fatal to the run: the controller stops enqueuing and drains in-flight work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Unauthorized | RemoteError::IncompatibleVersion)
    }
}
