use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    /// No registered instance is healthy and serves the requested tier.
    /// Fatal for the affected sub-request; callers fall back rather than
    /// block.
    #[error("No healthy backend for the requested capability")]
    NoHealthyBackend,

    #[error("Generation timed out on instance {instance} after {timeout_ms}ms")]
    Timeout { instance: String, timeout_ms: u64 },

    #[error("Connection error on instance {instance}: {message}")]
    Connection { instance: String, message: String },

    #[error("Backend returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl BackendError {
    /// Transient errors warrant one retry against a different instance;
    /// anything else is surfaced immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. })
    }
}
