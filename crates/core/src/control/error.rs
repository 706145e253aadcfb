use std::time::Duration;
use thiserror::Error;
use torrotate_common::RotateError;

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to connect to control port {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("command rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed reply: {0}")]
    Protocol(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("NEWNYM rate limited for another {0:?}")]
    RateLimited(Duration),

    #[error("control session is not authenticated")]
    NotAuthenticated,

    #[error("control connection closed")]
    ConnectionClosed,

    #[error("event subscription already taken")]
    AlreadySubscribed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ControlError> for RotateError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Connect { .. } | ControlError::ConnectionClosed => {
                RotateError::connect(err.to_string())
            }
            ControlError::AuthenticationFailed(reason) => RotateError::AuthenticationFailed(reason),
            ControlError::Timeout(_) => RotateError::Timeout,
            other => RotateError::protocol(other.to_string()),
        }
    }
}
