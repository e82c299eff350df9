use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Agent timed out: {0}")]
    Timeout(String),

    #[error("Agent output exceeded buffer limit: {0}")]
    MaxBuffer(String),

    #[error("Agent binary not found: {0}")]
    MissingBinary(String),

    #[error("Agent exited non-zero: {0}")]
    NonZeroExit(String),

    #[error("Agent output could not be parsed: {0}")]
    Parse(String),

    #[error("Stale session: {0}")]
    StaleSession(String),

    #[error("Daily token budget exhausted: {0}")]
    Budget(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
