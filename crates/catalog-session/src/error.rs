//! Session authority error types

use crate::store::StoreError;

/// Result type for session authority operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session authority error types
///
/// None of these are fatal to the coordinator itself: the lease protocol
/// logs and retries store failures, and `NotLeader` is the expected answer
/// for a context that does not currently hold the lease.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed lease record: {0}")]
    MalformedRecord(String),

    #[error("Store write failed: {0}")]
    WriteFailed(String),

    #[error("Not the active session context; retry from the context holding the lease")]
    NotLeader,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Authentication backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SessionError {
    pub fn malformed_record<T: Into<String>>(msg: T) -> Self {
        Self::MalformedRecord(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn backend<T: Into<String>>(msg: T) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether the caller was turned away by the session gate
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader)
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::WriteFailed(msg) => Self::WriteFailed(msg),
            StoreError::Backend(msg) => Self::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let err: SessionError = StoreError::Unavailable("disabled".into()).into();
        assert!(matches!(err, SessionError::StoreUnavailable(_)));

        let err: SessionError = StoreError::WriteFailed("quota".into()).into();
        assert!(matches!(err, SessionError::WriteFailed(_)));

        let err: SessionError = StoreError::Backend("corrupt".into()).into();
        assert!(matches!(err, SessionError::Storage(_)));
    }

    #[test]
    fn test_not_leader_message() {
        let err = SessionError::NotLeader;
        assert!(err.is_not_leader());
        assert!(err.to_string().contains("context holding the lease"));
    }
}
