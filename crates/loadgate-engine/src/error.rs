use loadgate_core::CoreError;
use thiserror::Error;

/// Errors raised by the engine before or around a run.
///
/// Per-request failures never surface here; they become outcomes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected before any traffic was sent.
    #[error(transparent)]
    Config(#[from] CoreError),

    /// A virtual user could not be prepared; fatal for the whole run.
    #[error("runner {runner} setup failed: {message}")]
    Setup { runner: u32, message: String },

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    pub fn setup(runner: u32, message: impl Into<String>) -> Self {
        Self::Setup {
            runner,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(CoreError::config(message))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
