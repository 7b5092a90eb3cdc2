use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
