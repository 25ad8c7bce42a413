//! Document store interface.
//!
//! The loader and pipeline only ever talk to a store through this trait, so the
//! Postgres backend and the in-memory backend are interchangeable.

use async_trait::async_trait;
use netharvest_common::NormalizedDocument;
use serde_json::Value;

use crate::error::Result;

/// Equality filter on a top-level document field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field: field.into(), value: value.into() }
    }

    /// Text form used for comparison, matching Postgres' `body->>'field'`.
    pub fn value_text(&self) -> String {
        json_text(&self.value)
    }
}

/// One document the store refused while the rest of its batch went through.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of an unordered batch write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub failures: Vec<WriteFailure>,
}

impl WriteSummary {
    /// Documents that ended up written (new or replaced).
    pub fn written(&self) -> u64 {
        self.inserted + self.upserted + self.modified
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable location of the store, safe to log.
    fn target(&self) -> String;

    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Create an ascending index on a top-level field. Idempotent.
    async fn create_index(&self, collection: &str, field: &str) -> Result<()>;

    /// Insert every document as new. Duplicate ids are reported per document
    /// in [`WriteSummary::failures`]; the rest of the batch is still written.
    async fn insert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary>;

    /// Replace the document sharing each id, or insert it if absent.
    async fn upsert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary>;

    async fn count(&self, collection: &str, filter: Option<&FieldFilter>) -> Result<u64>;

    /// Fetch one document body by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Release the connection. Further calls may fail.
    async fn close(&self);
}

pub(crate) fn json_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
