//! Error taxonomy shared by the fetch, transform and load stages.
//!
//! Containment rules:
//! - `TransformError` is contained at the item that produced it.
//! - `FetchError` and `LoadError` are contained at the source.
//! - `ConnectionError` is the only error that aborts a whole run.

use thiserror::Error;

/// No usable response after the retry budget was spent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("no usable response from {url} after {attempts} attempt(s): {reason}")]
    Exhausted {
        url: String,
        attempts: u32,
        /// HTTP status of the last attempt, `None` for transport failures.
        last_status: Option<u16>,
        reason: String,
    },

    #[error("invalid request to {url}: {reason}")]
    InvalidRequest { url: String, reason: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Exhausted { url, .. } | FetchError::InvalidRequest { url, .. } => url,
        }
    }
}

/// A single raw item could not be normalised.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("item {index} has no `{field}` identifier")]
    MissingId { index: usize, field: &'static str },

    #[error("document identifier must not be empty")]
    EmptyId,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Storage write failure for a whole batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("write to collection `{collection}` failed: {reason}")]
    Store { collection: String, reason: String },

    #[error("invalid collection name `{0}`")]
    InvalidCollection(String),
}

/// The document store could not be reached when the run started.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("document store unreachable at {target}: {reason}")]
pub struct ConnectionError {
    pub target: String,
    pub reason: String,
}
