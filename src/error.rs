use thiserror::Error;
use tokio::sync::mpsc;

use crate::sink::SinkCommand;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Worker pool was closed: {0}")]
    WorkerPool(#[from] tokio::sync::AcquireError),

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Couldn't write record to sink: {0}")]
    SinkWrite(std::io::Error),
    #[error("The sink writer stopped, records can no longer be persisted.")]
    SinkClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<mpsc::error::SendError<SinkCommand>> for Error {
    fn from(_value: mpsc::error::SendError<SinkCommand>) -> Self {
        Error::SinkClosed
    }
}

/// Failure of a single HTTP request against the remote service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FetchError {
    /// Network errors, 5xx and 429 are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Malformed(_) => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Status(status) if *status == reqwest::StatusCode::TOO_MANY_REQUESTS)
    }
}
