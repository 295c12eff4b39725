use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Meeting {0} already exists")]
    DuplicateMeeting(String),

    #[error("Meeting {0} not found")]
    NotFound(String),

    #[error("No available worker ports in range {start}-{end}")]
    AllocationExhausted { start: u16, end: u16 },

    #[error("Failed to spawn worker: {0}")]
    SpawnFailure(String),

    #[error("Upstream disconnected: {0}")]
    UpstreamDisconnect(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Write failure: {0}")]
    WriteFailure(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("SDK error: {0}")]
    Sdk(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
