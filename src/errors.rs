use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnsubError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The model call failed outright. Fatal for the run.
    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// The reply did not have the required shape.
    #[error("{0}")]
    Format(String),

    /// Injected code threw inside the page.
    #[error("{0}")]
    Script(String),

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task cancelled")]
    Cancelled,
}

impl UnsubError {
    /// Errors the agent loop feeds back to the model instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, UnsubError::Format(_) | UnsubError::Script(_))
    }
}

pub type UnsubResult<T> = Result<T, UnsubError>;
