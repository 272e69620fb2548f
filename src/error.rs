//! Error taxonomy for the synchronization runtime.
//!
//! Every boundary operation resolves to exactly one status: `Ok` or one of
//! the kinds below. Internal helpers map failures to this taxonomy at the
//! point of detection; there is no separate "wait failed" kind because a
//! blocking wait runs to completion once entered.

use thiserror::Error;

/// Result type alias for all runtime operations.
pub type Result<T> = std::result::Result<T, GpuSyncError>;

/// Status kinds surfaced by the event subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuSyncError {
    /// The caller supplied an unsupported configuration, or a derived
    /// numeric result is undefined (e.g. a zero clock frequency).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The operation targets a destroyed or unknown handle.
    #[error("invalid resource handle")]
    InvalidResourceHandle,

    /// The requested result is not available yet; the caller is expected
    /// to retry or wait.
    #[error("not ready")]
    NotReady,
}

impl GpuSyncError {
    /// True for the retryable `NotReady` kind.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, GpuSyncError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GpuSyncError::InvalidValue("flags 0x3 unsupported".into());
        assert_eq!(e.to_string(), "invalid value: flags 0x3 unsupported");
        assert_eq!(
            GpuSyncError::InvalidResourceHandle.to_string(),
            "invalid resource handle"
        );
        assert_eq!(GpuSyncError::NotReady.to_string(), "not ready");
    }

    #[test]
    fn test_not_ready_predicate() {
        assert!(GpuSyncError::NotReady.is_not_ready());
        assert!(!GpuSyncError::InvalidResourceHandle.is_not_ready());
    }
}
