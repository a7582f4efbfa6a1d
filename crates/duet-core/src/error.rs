//! Error types for duet

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an external collaborator (anchor, categorizer).
///
/// The collaborator decides whether the failure is worth retrying; the
/// worker never inspects the message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub retryable: bool,
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        // 4xx means the request itself is wrong; repeating it won't help
        let retryable = match err.status() {
            Some(status) => !status.is_client_error(),
            None => true,
        };
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}

impl Error {
    /// Whether a job hitting this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Collaborator(e) => e.retryable,
            Error::InvalidData(_) | Error::NotFound(_) | Error::Json(_) | Error::Regex(_) => false,
            Error::Database(_)
            | Error::Pool(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::Queue(_) => true,
        }
    }
}
