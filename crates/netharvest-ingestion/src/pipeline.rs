//! End-to-end harvest pipeline.
//!
//! Orchestrates one run:
//!   1. Ping the document store (fatal on failure)
//!   2. Prepare each enabled source's collection and index
//!   3. Per source, in order: extract → transform → load
//!   4. Count documents per collection and log the verdict
//!
//! Sources run one after another and a failing source never stops the next.
//! The run succeeds only if every enabled source succeeds. Closing the store
//! is left to the caller so it happens on every exit path, interrupts
//! included.

use chrono::{DateTime, Utc};
use netharvest_common::ConnectionError;
use netharvest_config::Config;
use netharvest_db::DocumentStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::fetcher::Fetcher;
use crate::loader::{LoadMode, LoadStats, Loader};
use crate::models::SourceKind;
use crate::normalise::{transform, TransformContext};
use crate::sources::{DohExtractor, NvdExtractor, SourceExtractor, SpeedExtractor, TraceExtractor};

// ── Jobs ──────────────────────────────────────────────────────────────────────

/// One enabled source: how to extract it and where its documents go.
pub struct SourceJob {
    pub extractor: Box<dyn SourceExtractor>,
    pub collection: String,
    pub index_field: String,
    pub mode: LoadMode,
}

impl SourceJob {
    pub fn new(
        extractor: Box<dyn SourceExtractor>,
        collection: impl Into<String>,
        index_field: impl Into<String>,
    ) -> Self {
        let mode = LoadMode::for_source(extractor.kind());
        Self { extractor, collection: collection.into(), index_field: index_field.into(), mode }
    }

    pub fn kind(&self) -> SourceKind {
        self.extractor.kind()
    }
}

/// Jobs for every source enabled in `config`, in trace, DoH, speed, NVD order.
pub fn jobs_from_config(config: &Config, now: DateTime<Utc>) -> Vec<SourceJob> {
    let s = &config.sources;
    let mut jobs = Vec::new();
    if s.trace.enabled {
        jobs.push(SourceJob::new(
            Box::new(TraceExtractor::from_config(&s.trace)),
            &s.trace.collection,
            &s.trace.index_field,
        ));
    }
    if s.doh.enabled {
        jobs.push(SourceJob::new(Box::new(DohExtractor::from_config(&s.doh)), &s.doh.collection, &s.doh.index_field));
    }
    if s.speed.enabled {
        jobs.push(SourceJob::new(
            Box::new(SpeedExtractor::from_config(&s.speed)),
            &s.speed.collection,
            &s.speed.index_field,
        ));
    }
    if s.nvd.enabled {
        jobs.push(SourceJob::new(
            Box::new(NvdExtractor::from_config(&s.nvd, now)),
            &s.nvd.collection,
            &s.nvd.index_field,
        ));
    }
    jobs
}

// ── Reports ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract   => "extract",
            Stage::Transform => "transform",
            Stage::Load      => "load",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub collection: String,
    pub success: bool,
    /// Stage that failed, if any.
    pub failed_stage: Option<Stage>,
    pub items_extracted: usize,
    pub documents: usize,
    pub item_errors: usize,
    pub load: Option<LoadStats>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SourceReport {
    fn new(source: SourceKind, collection: &str) -> Self {
        Self {
            source,
            collection: collection.to_string(),
            success: true,
            failed_stage: None,
            items_extracted: 0,
            documents: 0,
            item_errors: 0,
            load: None,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        error!(source = %self.source, stage = stage.as_str(), reason = %reason, "Source failed");
        self.success = false;
        self.failed_stage = Some(stage);
        self.errors.push(reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionCount {
    pub collection: String,
    pub documents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceReport>,
    pub collection_counts: Vec<CollectionCount>,
    pub success: bool,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == kind)
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| !s.success)
    }
}

// ── Pipeline orchestrator ─────────────────────────────────────────────────────

pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    loader: Loader,
    fetcher: Fetcher,
    jobs: Vec<SourceJob>,
    etl_version: String,
    clock: fn() -> DateTime<Utc>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn DocumentStore>, fetcher: Fetcher, etl_version: impl Into<String>) -> Self {
        Self {
            loader: Loader::new(store.clone()),
            store,
            fetcher,
            jobs: Vec::new(),
            etl_version: etl_version.into(),
            clock: Utc::now,
        }
    }

    /// Pipeline over every source enabled in `config`.
    pub fn from_config(config: &Config, store: Arc<dyn DocumentStore>, fetcher: Fetcher) -> Self {
        let pipeline = Self::new(store, fetcher, &config.connector.etl_version);
        let now = (pipeline.clock)();
        pipeline.with_jobs(jobs_from_config(config, now))
    }

    pub fn with_job(mut self, job: SourceJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_jobs(mut self, jobs: impl IntoIterator<Item = SourceJob>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    /// Source of ingestion timestamps.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.jobs.iter().map(SourceJob::kind).collect()
    }

    /// Run every job once. Only an unreachable store aborts the run.
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self) -> Result<PipelineReport, ConnectionError> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let t0 = Instant::now();

        info!(
            target_store = %self.store.target(),
            sources = ?self.sources(),
            etl_version = %self.etl_version,
            "Starting harvest run"
        );

        self.connect().await?;

        if self.jobs.is_empty() {
            warn!("No sources enabled");
        }

        let mut sources = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            sources.push(self.run_source(job).await);
        }

        let collection_counts = self.summarize().await;
        let success = sources.iter().all(|s| s.success);
        let report = PipelineReport {
            run_id,
            sources,
            collection_counts,
            success,
            duration_ms: t0.elapsed().as_millis() as u64,
        };

        for s in &report.sources {
            info!(
                source    = %s.source,
                success   = s.success,
                documents = s.documents,
                errors    = s.errors.len(),
                "Source result"
            );
        }
        if report.success {
            info!(duration_ms = report.duration_ms, "Harvest run completed successfully");
        } else {
            let failed: Vec<&str> = report.failed_sources().map(|s| s.source.as_str()).collect();
            warn!(duration_ms = report.duration_ms, ?failed, "Harvest run completed with failures");
        }
        Ok(report)
    }

    /// Ping, then make sure every job's collection and index exist.
    async fn connect(&self) -> Result<(), ConnectionError> {
        let unreachable = |reason: String| {
            error!(target_store = %self.store.target(), reason = %reason, "Document store unavailable");
            ConnectionError { target: self.store.target(), reason }
        };

        self.store.ping().await.map_err(|e| unreachable(e.to_string()))?;
        info!(target_store = %self.store.target(), "Connected to document store");

        for job in &self.jobs {
            self.store
                .ensure_collection(&job.collection)
                .await
                .map_err(|e| unreachable(format!("preparing `{}`: {e}", job.collection)))?;
            self.store
                .create_index(&job.collection, &job.index_field)
                .await
                .map_err(|e| unreachable(format!("indexing `{}.{}`: {e}", job.collection, job.index_field)))?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(source = %job.kind(), collection = %job.collection))]
    async fn run_source(&self, job: &SourceJob) -> SourceReport {
        let t0 = Instant::now();
        let mut report = SourceReport::new(job.kind(), &job.collection);
        info!("Source started");

        // ── Extract ──
        let Some(payload) = job.extractor.extract(&self.fetcher).await else {
            report.fail(Stage::Extract, "no data could be extracted");
            report.duration_ms = t0.elapsed().as_millis() as u64;
            return report;
        };
        report.items_extracted = payload.item_count();

        // ── Transform ──
        let ctx = TransformContext::new((self.clock)(), &self.etl_version);
        let outcome = transform(&payload, &ctx);
        report.documents = outcome.documents.len();
        report.item_errors = outcome.errors.len();
        report.errors.extend(outcome.errors.iter().map(ToString::to_string));
        info!(
            stage = "transform",
            documents = report.documents,
            item_errors = report.item_errors,
            "Payload transformed"
        );

        if outcome.documents.is_empty() && !outcome.errors.is_empty() {
            report.fail(Stage::Transform, "no item could be transformed");
            report.duration_ms = t0.elapsed().as_millis() as u64;
            return report;
        }

        // ── Load ──
        match self.loader.load(&job.collection, &outcome.documents, job.mode).await {
            Ok(stats) => {
                if !stats.is_clean() {
                    report.fail(Stage::Load, format!("{} document(s) not written", stats.failures.len()));
                }
                report.load = Some(stats);
            }
            Err(e) => report.fail(Stage::Load, e.to_string()),
        }

        report.duration_ms = t0.elapsed().as_millis() as u64;
        report
    }

    async fn summarize(&self) -> Vec<CollectionCount> {
        let mut counts: Vec<CollectionCount> = Vec::new();
        for job in &self.jobs {
            if counts.iter().any(|c| c.collection == job.collection) {
                continue;
            }
            match self.store.count(&job.collection, None).await {
                Ok(documents) => {
                    info!(collection = %job.collection, documents, "Collection total");
                    counts.push(CollectionCount { collection: job.collection.clone(), documents });
                }
                Err(e) => warn!(collection = %job.collection, error = %e, "Could not count collection"),
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{RetryPolicy, TransportResponse};
    use crate::testing::{RecordingSleeper, ScriptedTransport};
    use chrono::TimeZone;
    use netharvest_db::MemoryStore;
    use std::time::Duration;

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn fetcher(transport: ScriptedTransport) -> Fetcher {
        Fetcher::new(
            Arc::new(transport),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy::new(1, Duration::ZERO),
        )
    }

    fn trace_job() -> SourceJob {
        SourceJob::new(
            Box::new(TraceExtractor::new("https://trace.test/cdn-cgi/trace")),
            "cloudflare_trace_raw",
            "ingestion_timestamp",
        )
    }

    #[tokio::test]
    async fn unreachable_store_aborts_before_any_source() {
        let transport = ScriptedTransport::sequence(vec![]);
        let store = Arc::new(MemoryStore::unreachable());
        let pipeline = Pipeline::new(store, fetcher(transport.clone()), "2.0").with_job(trace_job());

        let err = pipeline.run().await.unwrap_err();
        assert_eq!(err.target, "memory://");
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn collections_are_prepared_with_indexes() {
        let transport = ScriptedTransport::sequence(vec![Ok(TransportResponse::new(200, "ip=192.0.2.1\n"))]);
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(store.clone(), fetcher(transport), "2.0")
            .with_clock(fixed_clock)
            .with_job(trace_job());

        let report = pipeline.run().await.unwrap();
        assert!(report.success);
        assert_eq!(store.indexes("cloudflare_trace_raw"), vec!["ingestion_timestamp".to_string()]);
        assert_eq!(
            report.collection_counts,
            vec![CollectionCount { collection: "cloudflare_trace_raw".into(), documents: 1 }]
        );
        let docs = store.documents("cloudflare_trace_raw");
        assert_eq!(docs[0]["_id"], "trace_2025-03-01T12:00:00.000000+00:00");
        assert_eq!(docs[0]["ip_address"], "192.0.2.1");
    }

    #[tokio::test]
    async fn failed_extract_marks_only_that_source() {
        let transport = ScriptedTransport::from_fn(|req| {
            if req.url.contains("trace") {
                Ok(TransportResponse::new(500, "boom"))
            } else {
                Ok(TransportResponse::new(200, r#"{"Status":0,"Answer":[]}"#))
            }
        });
        let store = Arc::new(MemoryStore::new());
        let doh = DohExtractor::new("https://dns.test/dns-query", vec!["b.test".into()]);
        let pipeline = Pipeline::new(store.clone(), fetcher(transport), "2.0")
            .with_job(trace_job())
            .with_job(SourceJob::new(Box::new(doh), "cloudflare_doh_raw", "query_name"));

        let report = pipeline.run().await.unwrap();
        assert!(!report.success);
        let trace = report.source(SourceKind::Trace).unwrap();
        assert_eq!(trace.failed_stage, Some(Stage::Extract));
        let doh = report.source(SourceKind::Doh).unwrap();
        assert!(doh.success);
        assert_eq!(doh.documents, 1);
    }

    #[tokio::test]
    async fn partially_refused_load_fails_the_source() {
        let transport = ScriptedTransport::sequence(vec![Ok(TransportResponse::new(200, "ip=192.0.2.1\n"))]);
        let store = Arc::new(MemoryStore::new());
        store.reject_id("trace_2025-03-01T12:00:00.000000+00:00");
        let pipeline = Pipeline::new(store, fetcher(transport), "2.0")
            .with_clock(fixed_clock)
            .with_job(trace_job());

        let report = pipeline.run().await.unwrap();
        let trace = report.source(SourceKind::Trace).unwrap();
        assert_eq!(trace.failed_stage, Some(Stage::Load));
        assert_eq!(trace.load.as_ref().map(|l| l.failures.len()), Some(1));
        assert!(!report.success);
    }

    #[test]
    fn disabled_sources_get_no_job() {
        let mut config = Config::default();
        config.sources.speed.enabled = false;
        config.sources.nvd.enabled = false;
        let kinds: Vec<SourceKind> = jobs_from_config(&config, fixed_clock()).iter().map(SourceJob::kind).collect();
        assert_eq!(kinds, vec![SourceKind::Trace, SourceKind::Doh]);

        let nvd = jobs_from_config(&Config::default(), fixed_clock()).pop().unwrap();
        assert_eq!(nvd.mode, LoadMode::Upsert);
        assert_eq!(nvd.collection, "nvd_cve_raw");
    }
}
