//! Error taxonomy for the download engine.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Fatal conditions inside a single download's lifecycle. Each one ends the
/// download with `status = error` and a human-readable message, except
/// `Cancelled` which marks a delete in flight.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("could not determine file size from the origin")]
    ProbeUnknownSize,

    #[error("timed out waiting for response headers")]
    ConnectTimeout,

    #[error("chunk {index}: origin returned status {status}")]
    ChunkHttpStatus { index: usize, status: StatusCode },

    #[error("no data received for {0:?}")]
    InactivityTimeout(Duration),

    #[error("chunk {index}: expected {expected} bytes, received {actual}")]
    ChunkIncomplete {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("merged output is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download cancelled")]
    Cancelled,
}

/// Errors surfaced by the registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("download not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
