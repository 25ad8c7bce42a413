//! Persisting normalised documents.
//!
//! Sources without a natural key (trace, DNS, speed) are inserted; sources
//! whose documents carry a stable external id (CVE) are upserted. Both modes
//! are unordered: a document the store refuses is reported in
//! [`LoadStats::failures`] and the rest of the batch is still written.

use netharvest_common::{LoadError, NormalizedDocument};
use netharvest_db::{DbError, DocumentStore, WriteFailure, WriteSummary};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::models::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Insert,
    Upsert,
}

impl LoadMode {
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Nvd => LoadMode::Upsert,
            SourceKind::Trace | SourceKind::Doh | SourceKind::Speed => LoadMode::Insert,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStats {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    /// `(document id, reason)` for every refused document.
    pub failures: Vec<(String, String)>,
}

impl LoadStats {
    pub fn written(&self) -> u64 {
        self.inserted + self.upserted + self.modified
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl From<WriteSummary> for LoadStats {
    fn from(s: WriteSummary) -> Self {
        Self {
            inserted: s.inserted,
            matched: s.matched,
            modified: s.modified,
            upserted: s.upserted,
            failures: s.failures.into_iter().map(|WriteFailure { id, reason }| (id, reason)).collect(),
        }
    }
}

pub struct Loader {
    store: Arc<dyn DocumentStore>,
}

impl Loader {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, docs), fields(stage = "load", n = docs.len()))]
    pub async fn load(
        &self,
        collection: &str,
        docs: &[NormalizedDocument],
        mode: LoadMode,
    ) -> Result<LoadStats, LoadError> {
        if docs.is_empty() {
            info!(collection, "Nothing to load");
            return Ok(LoadStats::default());
        }

        let written = match mode {
            LoadMode::Insert => self.store.insert_many(collection, docs).await,
            LoadMode::Upsert => self.store.upsert_many(collection, docs).await,
        };
        let stats = LoadStats::from(written.map_err(|e| load_error(collection, e))?);

        for (id, reason) in &stats.failures {
            warn!(collection, id = %id, reason = %reason, "Document not written");
        }
        info!(
            collection,
            inserted = stats.inserted,
            upserted = stats.upserted,
            matched  = stats.matched,
            modified = stats.modified,
            failed   = stats.failures.len(),
            "Documents loaded"
        );
        Ok(stats)
    }
}

fn load_error(collection: &str, e: DbError) -> LoadError {
    match e {
        DbError::InvalidIdentifier(name) => LoadError::InvalidCollection(name),
        other => LoadError::Store { collection: collection.to_string(), reason: other.to_string() },
    }
}
