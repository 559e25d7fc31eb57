use crate::messages::SessionStatus;
use thiserror::Error;

/// Errors produced by the bgproc session layer.
#[derive(Debug, Error)]
pub enum ProcError {
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{session_id}' is not running")]
    NotRunning {
        session_id: String,
        status: SessionStatus,
    },

    #[error("invalid transition: session is {from}, cannot apply {event}")]
    InvalidTransition {
        from: SessionStatus,
        event: &'static str,
    },

    #[error("driver error: {0}")]
    Driver(String),

    #[error("timeout")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcError {
    /// Whether this error came from the process driver rather than session state.
    pub fn is_driver_failure(&self) -> bool {
        matches!(self, ProcError::Driver(_) | ProcError::Timeout | ProcError::Io(_))
    }
}

impl From<serde_json::Error> for ProcError {
    fn from(e: serde_json::Error) -> Self {
        ProcError::Codec(e.to_string())
    }
}

pub type ProcResult<T> = Result<T, ProcError>;
