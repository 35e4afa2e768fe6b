use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Lease on job {job_id} lost by {owner}")]
    LeaseLost { job_id: JobId, owner: String },

    #[error("Job {job_id} is leased by {owner}")]
    LeaseHeld { job_id: JobId, owner: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Phase strategy fault: {0}")]
    StrategyFault(String),

    #[error("Concurrent modification of job {0}")]
    VersionConflict(JobId),

    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Store hiccups worth retrying with backoff. Logical errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    /// Stable machine-readable code, used by the HTTP adapter.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "job_not_found",
            Error::AlreadyExists(_) => "job_already_exists",
            Error::LeaseLost { .. } => "lease_lost",
            Error::LeaseHeld { .. } => "lease_held",
            Error::Conflict(_) => "conflict",
            Error::InvalidSubmission(_) => "invalid_submission",
            Error::InvalidConfig(_) => "invalid_config",
            Error::StrategyFault(_) => "strategy_fault",
            Error::VersionConflict(_) => "version_conflict",
            Error::Store(_) => "store_unavailable",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
