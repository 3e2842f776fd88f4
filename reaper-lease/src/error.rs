//! Lease broker client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    /// No resource of the requested type is in the requested state.
    #[error("resources not found")]
    NotFound,

    #[error("resources already used by another user")]
    AlreadyInUse,

    #[error("resource type {0:?} does not exist")]
    TypeNotFound(String),

    /// The broker answered with something that is not a resource.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// Every attempt failed with a retryable error.
    #[error("{action} failed after {} attempts: [{}]", .errors.len(), .errors.join(", "))]
    RetriesExhausted { action: String, errors: Vec<String> },
}

impl LeaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LeaseError::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
