//! Payload normalisation.
//!
//! Pure functions from a [`RawPayload`] to [`NormalizedDocument`]s. No I/O;
//! the ingestion timestamp and connector version come from a
//! [`TransformContext`], so the same payload and context always produce the
//! same documents.
//!
//! - `trace`: declarative field map over the key=value record
//! - `dns`:   one document per DoH response
//! - `speed`: one aggregate document over all samples
//! - `cve`:   one document per feed item, keyed by CVE id

pub mod cve;
pub mod dns;
pub mod speed;
pub mod trace;

pub use dns::response_code_label;
pub use speed::aggregate_samples;

use chrono::{DateTime, Utc};
use netharvest_common::{iso_timestamp, NormalizedDocument, TransformError};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{RawPayload, SourceKind};

#[derive(Debug, Clone, PartialEq)]
pub struct TransformContext {
    pub ingestion_timestamp: DateTime<Utc>,
    pub etl_version: String,
}

impl TransformContext {
    pub fn new(ingestion_timestamp: DateTime<Utc>, etl_version: impl Into<String>) -> Self {
        Self { ingestion_timestamp, etl_version: etl_version.into() }
    }

    /// Timestamp text used inside generated ids.
    pub fn stamp(&self) -> String {
        iso_timestamp(self.ingestion_timestamp)
    }

    pub(crate) fn document(
        &self,
        id: impl Into<String>,
        kind: SourceKind,
        raw_data: Value,
    ) -> Result<NormalizedDocument, TransformError> {
        NormalizedDocument::new(id, kind.source_api(), &self.etl_version, self.ingestion_timestamp, raw_data)
    }
}

/// Documents produced plus the items that had to be skipped.
#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub documents: Vec<NormalizedDocument>,
    pub errors: Vec<TransformError>,
}

impl TransformOutcome {
    pub fn single(doc: NormalizedDocument) -> Self {
        Self { documents: vec![doc], errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.errors.is_empty()
    }
}

/// `(source_key, target_key, default)`; absent keys take the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub source: &'static str,
    pub target: &'static str,
    pub default: &'static str,
}

impl FieldRule {
    pub const fn new(source: &'static str, target: &'static str, default: &'static str) -> Self {
        Self { source, target, default }
    }
}

/// Apply `rules` in order, copying string values from `raw` into `doc`.
pub fn apply_field_map(raw: &BTreeMap<String, String>, rules: &[FieldRule], doc: &mut NormalizedDocument) {
    for rule in rules {
        let value = raw.get(rule.source).map(String::as_str).unwrap_or(rule.default);
        doc.set(rule.target, value);
    }
}

/// Dispatch on the payload variant.
pub fn transform(payload: &RawPayload, ctx: &TransformContext) -> TransformOutcome {
    match payload {
        RawPayload::Trace(fields) => trace::transform_trace(fields, ctx),
        RawPayload::Dns(responses) => dns::transform_dns(responses, ctx),
        RawPayload::Speed(samples) => match aggregate_samples(samples, ctx) {
            Ok(Some(doc)) => TransformOutcome::single(doc),
            Ok(None) => TransformOutcome::default(),
            Err(e) => TransformOutcome { documents: Vec::new(), errors: vec![e] },
        },
        RawPayload::CveFeed(items) => cve::transform_cves(items, ctx),
    }
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
