use thiserror::Error;

use crate::model::JobState;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is not finished (state: {state})")]
    IncompleteJob { job_id: String, state: JobState },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl CrawlError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, CrawlError::InvalidInput(_))
    }
}

/// Failure reported by a profile source. The coordinator retries
/// `Transient` failures and records `Permanent` ones straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SourceError::Permanent(format!("Undecodable response: {}", err));
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                SourceError::Transient(format!("HTTP {}: {}", status, err))
            }
            Some(status) => SourceError::Permanent(format!("HTTP {}: {}", status, err)),
            None => SourceError::Transient(err.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
