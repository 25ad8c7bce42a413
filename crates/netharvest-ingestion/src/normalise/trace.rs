//! Connection-info (trace) documents.

use netharvest_common::{NormalizedDocument, TransformError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{apply_field_map, FieldRule, TransformContext, TransformOutcome};
use crate::models::SourceKind;

pub const TRACE_FIELDS: &[FieldRule] = &[
    FieldRule::new("ip",           "ip_address",   "unknown"),
    FieldRule::new("ts",           "timestamp",    ""),
    FieldRule::new("visit_scheme", "visit_scheme", ""),
    FieldRule::new("uag",          "user_agent",   ""),
    FieldRule::new("colo",         "colo",         ""),
    FieldRule::new("http",         "http_version", ""),
    FieldRule::new("loc",          "location",     ""),
    FieldRule::new("tls",          "tls_version",  ""),
    FieldRule::new("sni",          "sni",          ""),
    FieldRule::new("warp",         "warp",         "off"),
    FieldRule::new("gateway",      "gateway",      "off"),
];

pub fn transform_trace(fields: &BTreeMap<String, String>, ctx: &TransformContext) -> TransformOutcome {
    match trace_document(fields, ctx) {
        Ok(doc) => {
            debug!(id = doc.id(), "Trace document built");
            TransformOutcome::single(doc)
        }
        Err(e) => {
            warn!(error = %e, "Trace record skipped");
            TransformOutcome { documents: Vec::new(), errors: vec![e] }
        }
    }
}

fn trace_document(
    fields: &BTreeMap<String, String>,
    ctx: &TransformContext,
) -> Result<NormalizedDocument, TransformError> {
    let raw: Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut doc = ctx.document(format!("trace_{}", ctx.stamp()), SourceKind::Trace, Value::Object(raw))?;
    apply_field_map(fields, TRACE_FIELDS, &mut doc);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx() -> TransformContext {
        TransformContext::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), "2.0")
    }

    #[test]
    fn maps_known_keys_and_defaults_the_rest() {
        let fields: BTreeMap<String, String> = [("ip", "203.0.113.7"), ("colo", "AMS"), ("uag", "curl/8.5")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let out = transform_trace(&fields, &ctx());
        assert!(out.errors.is_empty());
        let doc = &out.documents[0];
        assert_eq!(doc.id(), "trace_2025-03-01T12:00:00.000000+00:00");
        assert_eq!(doc.field("ip_address").unwrap(), "203.0.113.7");
        assert_eq!(doc.field("user_agent").unwrap(), "curl/8.5");
        assert_eq!(doc.field("sni").unwrap(), "");
        assert_eq!(doc.field("warp").unwrap(), "off");
        assert_eq!(doc.source_api(), "Cloudflare Trace");
        assert_eq!(doc.raw_data()["colo"], "AMS");
    }

    #[test]
    fn empty_record_still_yields_defaults() {
        let out = transform_trace(&BTreeMap::new(), &ctx());
        let doc = &out.documents[0];
        assert_eq!(doc.field("ip_address").unwrap(), "unknown");
        assert_eq!(doc.field("gateway").unwrap(), "off");
        assert_eq!(doc.fields().len(), TRACE_FIELDS.len());
    }
}
