use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CycloneError {
    #[error("Job not found: {queue}/{id}")]
    JobNotFound { queue: String, id: String },

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Worker slot not found: {0}")]
    SlotNotFound(Uuid),

    #[error("Conditional write rejected for {0}: record changed underneath")]
    ConditionFailed(String),

    #[error("Task token not found or already resolved: {0}")]
    TaskNotFound(String),

    #[error("Work queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Dispatch stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job submission: {0}")]
    InvalidSubmission(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CycloneError {
    /// Whether the error belongs to the transient-infrastructure class and is
    /// worth retrying locally. Configuration, validation and lookup errors are
    /// fatal to the operation that hit them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CycloneError::ConditionFailed(_)
                | CycloneError::QueueUnavailable(_)
                | CycloneError::StreamUnavailable(_)
                | CycloneError::StoreUnavailable(_)
                | CycloneError::Provisioning(_)
                | CycloneError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CycloneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_errors_are_transient() {
        assert!(CycloneError::QueueUnavailable("q".into()).is_transient());
        assert!(CycloneError::ConditionFailed("k".into()).is_transient());
        assert!(CycloneError::Provisioning("boom".into()).is_transient());
    }

    #[test]
    fn config_and_lookup_errors_are_fatal() {
        assert!(!CycloneError::Config("ratio".into()).is_transient());
        assert!(!CycloneError::UnknownRegion("mars-1".into()).is_transient());
        assert!(!CycloneError::JobNotFound {
            queue: "q".into(),
            id: "1".into()
        }
        .is_transient());
    }
}
