use std::time::Duration;

use thiserror::Error;

/// Errors raised by the server core
#[derive(Debug, Error)]
pub enum LanshareError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame exceeds the {limit} byte limit")]
    FrameTooLarge { limit: usize },
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("File transfer error: {0}")]
    Transfer(String),
    #[error("User store error: {0}")]
    UserStore(String),
    #[error("External service error: {0}")]
    External(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Peer did not drain its queue within {waited:?}")]
    SendStalled { waited: Duration },
}

pub type Result<T, E = LanshareError> = std::result::Result<T, E>;

impl LanshareError {
    /// Whether the peer should get an error reply before the session closes
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            LanshareError::Json(_)
                | LanshareError::FrameTooLarge { .. }
                | LanshareError::InvalidUtf8
                | LanshareError::Protocol(_)
        )
    }
}
