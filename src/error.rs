//! Sync error types.
//!
//! Only genuine failures are errors. "Already signaled" and "timed out" are
//! successful outcomes and travel inside `Ok` as raw [`vk::Result`] codes.

use ash::vk;
use thiserror::Error;

/// Errors produced by the sync core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A native call returned something other than the statuses the caller expects.
    /// Never retried: it means device loss or a programming error.
    #[error("{operation} failed: {result}")]
    Device {
        operation: &'static str,
        result: vk::Result,
    },
    /// The object does not hold the resource the operation needs.
    #[error("not supported in the current state: {0}")]
    NotSupported(&'static str),
    /// Duplicating an OS descriptor failed.
    #[error("descriptor duplication failed: {0}")]
    Descriptor(#[from] std::io::Error),
    /// The submission worker thread could not be started.
    #[error("failed to start submission worker: {0}")]
    WorkerSpawn(std::io::Error),
    /// The submission worker is gone; nothing submitted now will execute.
    #[error("submission worker has shut down")]
    WorkerLost,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Returns a mapper for `map_err` that tags a raw result with the failing call.
    pub fn device(operation: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Device { operation, result }
    }

    /// Whether this is a "not supported in this state" outcome rather than a failure.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// The raw device result, if this is a device error.
    pub fn device_result(&self) -> Option<vk::Result> {
        match self {
            Self::Device { result, .. } => Some(*result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Device {
            operation: "vkCreateEvent",
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        };
        assert!(err.to_string().starts_with("vkCreateEvent failed"));

        let err = SyncError::NotSupported("no native fence");
        assert_eq!(
            err.to_string(),
            "not supported in the current state: no native fence"
        );
    }

    #[test]
    fn test_error_kinds() {
        let err = SyncError::device("vkWaitForFences")(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.device_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(!err.is_not_supported());
        assert!(SyncError::NotSupported("no fence").is_not_supported());
        assert_eq!(SyncError::WorkerLost.device_result(), None);
    }
}
