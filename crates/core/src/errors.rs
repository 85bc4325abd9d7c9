use thiserror::Error;

/// Core error type shared by the shale crates
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

impl CoreError {
    /// Create a new logging setup error
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }
}

/// Result alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
