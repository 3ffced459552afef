//! Error taxonomy for the sync and enrichment pipeline.
//!
//! Fatal variants (`Connect`, `Write`, `Config`) abort a run and surface to
//! the CLI as a non-zero exit. `Encoding` is recovered locally by the bulk
//! sender where possible; `Mapping` is handled per record by the enrichment
//! engine and never aborts a run on its own.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("index backend unreachable: {0}")]
    Connect(String),

    #[error("index write failed: {0}")]
    Write(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bulk payload encoding failed: {0}")]
    Encoding(String),

    #[error("record mapping failed: {0}")]
    Mapping(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("identity backend error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            HarvestError::Connect(err.to_string())
        } else {
            HarvestError::Write(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
