//! netharvest-common: Shared types and errors used across all netharvest crates.

pub mod document;
pub mod error;

// Re-export commonly used types
pub use document::{iso_timestamp, NormalizedDocument, ID_FIELD, RESERVED_FIELDS};
pub use error::{ConnectionError, FetchError, LoadError, TransformError};
