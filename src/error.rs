//! Error types for procflow.

use thiserror::Error;

/// Main error type for procflow.
#[derive(Error, Debug)]
pub enum ProcflowError {
    #[error("Invalid worker spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid channel configuration: {0}")]
    InvalidChannel(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Failed to wait for worker: {0}")]
    Wait(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Semaphore error: {0}")]
    Semaphore(#[source] std::io::Error),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Message of {size} bytes exceeds the slot payload limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Corrupt channel slot: {0}")]
    CorruptSlot(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for procflow operations.
pub type Result<T> = std::result::Result<T, ProcflowError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_invalid_spec_error_message() {
        let err = ProcflowError::InvalidSpec("count must be at least 1".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid worker spec"));
        assert!(msg.contains("count must be at least 1"));
    }

    #[test]
    fn test_message_too_large_error_message() {
        let err = ProcflowError::MessageTooLarge {
            size: 9000,
            max: 4088,
        };
        let msg = err.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("4088"));
    }

    #[test]
    fn test_channel_closed_error_message() {
        assert_eq!(ProcflowError::ChannelClosed.to_string(), "Channel is closed");
    }

    #[test]
    fn test_semaphore_error_keeps_source() {
        use std::error::Error as _;

        let err = ProcflowError::Semaphore(io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.to_string().starts_with("Semaphore error"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "no access");
        let err: ProcflowError = io_err.into();
        assert!(err.to_string().contains("no access"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: ProcflowError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u8> {
            Ok(7)
        }

        fn returns_err() -> Result<u8> {
            Err(ProcflowError::ChannelClosed)
        }

        assert_eq!(returns_ok().unwrap(), 7);
        assert!(matches!(returns_err(), Err(ProcflowError::ChannelClosed)));
    }
}
