//! netharvest-ingestion: Extract, transform and load pipeline.
//! - HTTP fetching with retry and rate-limit backoff
//! - Source extractors (Cloudflare trace, DoH, speed test; NVD CVE feed)
//! - Pure payload → document transformers
//! - Insert / upsert loader over a `DocumentStore`
//! - Sequential pipeline orchestrator with a per-run report

pub mod fetcher;
pub mod loader;
pub mod models;
pub mod normalise;
pub mod pipeline;
pub mod sources;
pub mod testing;

pub use fetcher::{Backoff, Body, FetchRequest, Fetcher, HttpTransport, Method, RetryPolicy, Sleeper};
pub use loader::{LoadMode, LoadStats, Loader};
pub use models::{DnsResponse, RawPayload, SourceKind, SpeedSample};
pub use normalise::{transform, TransformContext, TransformOutcome};
pub use pipeline::{Pipeline, PipelineReport, SourceJob, SourceReport, Stage};
pub use sources::SourceExtractor;
