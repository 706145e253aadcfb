use thiserror::Error;

/// Top-level error type for the rotation daemon
#[derive(Debug, Error)]
pub enum RotateError {
    #[error("Tor launch failed: {0}")]
    Launch(String),

    #[error("Control port connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Control protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for daemon operations
pub type Result<T, E = RotateError> = std::result::Result<T, E>;

impl RotateError {
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors that must terminate the daemon with a non-zero exit code.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::Connect(_) | Self::AuthenticationFailed(_) | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_auth_failures_are_fatal() {
        assert!(RotateError::launch("binary not found").is_fatal());
        assert!(RotateError::AuthenticationFailed("bad cookie".into()).is_fatal());
    }

    #[test]
    fn protocol_errors_are_not_fatal() {
        let err = RotateError::protocol("552 Unrecognized key");
        assert!(!err.is_fatal());
        assert!(!RotateError::Timeout.is_fatal());
    }
}
