use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid experiment id: {0:?}")]
    InvalidExperimentId(String),

    #[error("Malformed metadata file {path}: {source}")]
    MalformedMeta {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker not in directory: {0}")]
    UnknownWorker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;
