use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickworkError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TickworkError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            TickworkError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TickworkError>;
