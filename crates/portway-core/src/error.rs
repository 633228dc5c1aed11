//! Server start errors

use thiserror::Error;

/// Errors returned when a server cannot start
///
/// A failed start leaves no state behind; the caller decides whether to retry.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = StartError::Bind {
            address: "127.0.0.1".to_string(),
            port: 8080,
            reason: "Address already in use".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("Failed to bind to 127.0.0.1"));
        assert!(display.contains("Address already in use"));
        assert!(display.contains("lsof -i :8080"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StartError = io_err.into();
        assert!(matches!(err, StartError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }
}
