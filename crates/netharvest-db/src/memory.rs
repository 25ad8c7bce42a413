//! In-memory document store.
//!
//! Same write semantics as the Postgres store (unique ids, unordered batches,
//! replace-on-upsert). Used by tests and by `--dry-run`. A few switches let
//! tests simulate an unreachable store or documents the store refuses.

use async_trait::async_trait;
use netharvest_common::NormalizedDocument;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::{DbError, Result};
use crate::postgres::check_identifier;
use crate::store::{json_text, DocumentStore, FieldFilter, WriteFailure, WriteSummary};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Collection>,
    unreachable: bool,
    fail_writes: bool,
    closed: bool,
    rejected_ids: HashSet<String>,
}

#[derive(Default)]
struct Collection {
    docs: BTreeMap<String, Value>,
    indexes: BTreeSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose ping always fails.
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.lock().unreachable = true;
        store
    }

    /// Make every subsequent batch write fail as a whole.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Refuse this id in subsequent writes, as a constraint violation would.
    pub fn reject_id(&self, id: impl Into<String>) {
        self.lock().rejected_ids.insert(id.into());
    }

    pub fn indexes(&self, collection: &str) -> Vec<String> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn writable(&mut self, collection: &str) -> Result<&mut Collection> {
        check_identifier(collection)?;
        if self.closed {
            return Err(DbError::Unavailable("store closed".to_string()));
        }
        if self.unreachable || self.fail_writes {
            return Err(DbError::Unavailable("simulated write failure".to_string()));
        }
        Ok(self.collections.entry(collection.to_string()).or_default())
    }

    fn readable(&self, collection: &str) -> Result<Option<&Collection>> {
        check_identifier(collection)?;
        if self.closed || self.unreachable {
            return Err(DbError::Unavailable("store closed".to_string()));
        }
        Ok(self.collections.get(collection))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn target(&self) -> String {
        "memory://".to_string()
    }

    async fn ping(&self) -> Result<()> {
        let inner = self.lock();
        if inner.unreachable || inner.closed {
            return Err(DbError::Unavailable("memory store is unreachable".to_string()));
        }
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.lock().writable(collection)?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        check_identifier(field)?;
        self.lock().writable(collection)?.indexes.insert(field.to_string());
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary> {
        let mut inner = self.lock();
        let rejected = inner.rejected_ids.clone();
        let coll = inner.writable(collection)?;
        let mut summary = WriteSummary::default();

        for doc in docs {
            let reason = if rejected.contains(doc.id()) {
                Some("rejected by store")
            } else if coll.docs.contains_key(doc.id()) {
                Some("duplicate key")
            } else {
                None
            };
            match reason {
                Some(reason) => summary.failures.push(WriteFailure {
                    id: doc.id().to_string(),
                    reason: reason.to_string(),
                }),
                None => {
                    coll.docs.insert(doc.id().to_string(), doc.to_json());
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn upsert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary> {
        let mut inner = self.lock();
        let rejected = inner.rejected_ids.clone();
        let coll = inner.writable(collection)?;
        let mut summary = WriteSummary::default();

        for doc in docs {
            if rejected.contains(doc.id()) {
                summary.failures.push(WriteFailure {
                    id: doc.id().to_string(),
                    reason: "rejected by store".to_string(),
                });
                continue;
            }
            let body = doc.to_json();
            match coll.docs.insert(doc.id().to_string(), body.clone()) {
                None => summary.upserted += 1,
                Some(previous) => {
                    summary.matched += 1;
                    if previous != body {
                        summary.modified += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn count(&self, collection: &str, filter: Option<&FieldFilter>) -> Result<u64> {
        let inner = self.lock();
        let Some(coll) = inner.readable(collection)? else {
            return Ok(0);
        };
        let n = match filter {
            None => coll.docs.len(),
            Some(f) => {
                let want = f.value_text();
                coll.docs
                    .values()
                    .filter(|body| body.get(&f.field).map(json_text).as_deref() == Some(want.as_str()))
                    .count()
            }
        };
        Ok(n as u64)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let inner = self.lock();
        Ok(inner.readable(collection)?.and_then(|c| c.docs.get(id).cloned()))
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}
