use thiserror::Error;

/// Common error type for fieldpoll components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using fieldpoll's Error.
pub type Result<T> = std::result::Result<T, Error>;
