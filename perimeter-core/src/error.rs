use perimeter_model::{GroupKey, ModelError, OrgId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Shared state store unavailable or returned garbage.
    #[error("State store error: {0}")]
    Store(String),

    /// A collaborator service (address, scan group, event) failed.
    #[error("{service} service error: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid model data: {0}")]
    Model(#[from] ModelError),

    #[error("Scan group not found: {0}")]
    GroupNotFound(GroupKey),

    #[error("Scan group is paused: {0}")]
    GroupPaused(GroupKey),

    #[error("Scan group is deleted: {0}")]
    GroupDeleted(GroupKey),

    #[error("Scan group {key} does not belong to org {caller}")]
    OrgMismatch { key: GroupKey, caller: OrgId },

    #[error("Scan group already started: {0}")]
    AlreadyStarted(GroupKey),

    #[error("Analyzer {analyzer} failed: {message}")]
    Analyzer {
        analyzer: &'static str,
        message: String,
    },

    #[error("Batcher buffer is full")]
    BatcherFull,

    #[error("Batcher is closed")]
    BatcherClosed,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn service(service: &'static str, message: impl Into<String>) -> Self {
        ScanError::Service {
            service,
            message: message.into(),
        }
    }

    pub fn analyzer(analyzer: &'static str, message: impl Into<String>) -> Self {
        ScanError::Analyzer {
            analyzer,
            message: message.into(),
        }
    }

    /// Infrastructure hiccups worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::Store(_)
                | ScanError::Service { .. }
                | ScanError::Timeout(_)
        )
    }

    /// Domain rule violations. These are answers, not failures, and must
    /// never be retried.
    pub fn is_domain_condition(&self) -> bool {
        matches!(
            self,
            ScanError::GroupNotFound(_)
                | ScanError::GroupPaused(_)
                | ScanError::GroupDeleted(_)
                | ScanError::OrgMismatch { .. }
                | ScanError::AlreadyStarted(_)
        )
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for ScanError {
    fn from(err: redis::RedisError) -> Self {
        ScanError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
