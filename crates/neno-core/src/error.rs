//! Error types for the neno engine core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    /// KV blocks ran out. Internal; the scheduler resolves it through
    /// preemption or fails the single affected request.
    #[error("kv cache exhausted")]
    ResourceExhausted,

    #[error("invalid sampling parameters: {0}")]
    InvalidParams(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("tokenization error: {0}")]
    Tokenization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
