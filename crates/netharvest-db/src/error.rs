//! Database error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Errors that concern one document rather than the store as a whole.
    pub fn is_document_level(&self) -> bool {
        matches!(self, DbError::Postgres(sqlx::Error::Database(_)))
    }
}
