use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("insufficient replicas: {available} available, {required} required")]
    InsufficientReplicas { available: usize, required: usize },

    #[error("write quorum not reached: {acked} acked, {required} required")]
    QuorumNotReached {
        acked: usize,
        required: usize,
        acked_nodes: Vec<String>,
        failed_nodes: Vec<String>,
    },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("request to node '{node}' failed: {message}")]
    Client { node: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        StoreError::Config(format!("invalid endpoint URL: {}", err))
    }
}
