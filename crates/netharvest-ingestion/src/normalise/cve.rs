//! CVE record documents from NVD `vulnerabilities[]` items.
//!
//! The document id is the CVE id, so reloading an overlapping window replaces
//! records instead of duplicating them.

use netharvest_common::{NormalizedDocument, TransformError};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{TransformContext, TransformOutcome};
use crate::models::SourceKind;

const NO_DESCRIPTION: &str = "No description available";

/// Metric families tried, in order, for the generic base score.
const CVSS_FALLBACK: [&str; 3] = ["cvssMetricV31", "cvssMetricV30", "cvssMetricV2"];

pub fn transform_cves(items: &[Value], ctx: &TransformContext) -> TransformOutcome {
    let mut out = TransformOutcome::default();

    for (index, item) in items.iter().enumerate() {
        match cve_document(index, item, ctx) {
            Ok(doc) => out.documents.push(doc),
            Err(e) => {
                warn!(index, error = %e, "CVE item skipped");
                out.errors.push(e);
            }
        }
    }

    debug!(documents = out.documents.len(), errors = out.errors.len(), "CVE items transformed");
    out
}

fn cve_document(index: usize, item: &Value, ctx: &TransformContext) -> Result<NormalizedDocument, TransformError> {
    if !item.is_object() {
        return Err(TransformError::Malformed(format!("feed item {index} is not a JSON object")));
    }
    let cve = item.get("cve").unwrap_or(item);
    let id = cve
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(TransformError::MissingId { index, field: "cve.id" })?;

    let metrics = cve.get("metrics").cloned().unwrap_or_else(|| json!({}));
    let (v31_score, v31_severity) = cvss(&metrics, "cvssMetricV31");
    let (base_score, base_severity) = CVSS_FALLBACK
        .iter()
        .map(|family| cvss(&metrics, family))
        .find(|(score, _)| !score.is_null())
        .unwrap_or((Value::Null, Value::Null));

    let weaknesses = array_or_empty(cve, "weaknesses");
    let cwe_ids: Vec<Value> = weaknesses
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|w| w.get("description").and_then(Value::as_array))
        .flatten()
        .filter(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
        .filter_map(|d| d.get("value").cloned())
        .collect();

    let references = array_or_empty(cve, "references");
    let reference_count = references.as_array().map_or(0, Vec::len);

    let doc = ctx
        .document(id, SourceKind::Nvd, item.clone())?
        .with_field("cve_id", id)
        .with_field("source_identifier", text(cve, "sourceIdentifier"))
        .with_field("published", text(cve, "published"))
        .with_field("last_modified", text(cve, "lastModified"))
        .with_field("vuln_status", text(cve, "vulnStatus"))
        .with_field("description", english_description(cve))
        .with_field("cvss_v31_score", v31_score)
        .with_field("cvss_v31_severity", v31_severity)
        .with_field("base_score", base_score)
        .with_field("base_severity", base_severity)
        .with_field("cwe_ids", cwe_ids)
        .with_field("reference_count", reference_count)
        .with_field("references", references)
        .with_field("weaknesses", weaknesses)
        .with_field("configurations", array_or_empty(cve, "configurations"))
        .with_field("vendor_comments", array_or_empty(cve, "vendorComments"))
        .with_field("metrics", metrics);
    Ok(doc)
}

/// First description whose `lang` is exactly `en`.
fn english_description(cve: &Value) -> String {
    cve.get("descriptions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
        .and_then(|d| d.get("value").and_then(Value::as_str))
        .unwrap_or(NO_DESCRIPTION)
        .to_string()
}

/// `(baseScore, baseSeverity)` from the first metric of a family, nulls when
/// absent. CVSS v2 keeps its severity beside `cvssData` rather than inside it.
fn cvss(metrics: &Value, family: &str) -> (Value, Value) {
    let Some(first) = metrics.get(family).and_then(|m| m.get(0)) else {
        return (Value::Null, Value::Null);
    };
    let data = first.get("cvssData");
    let score = data.and_then(|d| d.get("baseScore")).cloned().unwrap_or(Value::Null);
    let severity = data
        .and_then(|d| d.get("baseSeverity"))
        .or_else(|| first.get("baseSeverity"))
        .cloned()
        .unwrap_or(Value::Null);
    (score, severity)
}

fn text(cve: &Value, key: &str) -> String {
    cve.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn array_or_empty(cve: &Value, key: &str) -> Value {
    match cve.get(key) {
        Some(v @ Value::Array(_)) => v.clone(),
        _ => Value::Array(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx() -> TransformContext {
        TransformContext::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), "2.0")
    }

    fn item(id: &str) -> Value {
        json!({
            "cve": {
                "id": id,
                "sourceIdentifier": "cve@mitre.org",
                "published": "2024-01-02T03:04:05.000",
                "lastModified": "2025-02-28T10:00:00.000",
                "vulnStatus": "Analyzed",
                "descriptions": [
                    {"lang": "es", "value": "Desbordamiento"},
                    {"lang": "en", "value": "Buffer overflow in parser."}
                ],
                "metrics": {
                    "cvssMetricV31": [{"cvssData": {"baseScore": 9.8, "baseSeverity": "CRITICAL"}}]
                },
                "weaknesses": [{"description": [{"lang": "en", "value": "CWE-787"}]}],
                "references": [{"url": "https://example.test/advisory"}]
            }
        })
    }

    #[test]
    fn full_record() {
        let out = transform_cves(&[item("CVE-2024-0001")], &ctx());
        let doc = &out.documents[0];
        assert_eq!(doc.id(), "CVE-2024-0001");
        assert_eq!(doc.field("description").unwrap(), "Buffer overflow in parser.");
        assert_eq!(doc.field("cvss_v31_score").unwrap(), 9.8);
        assert_eq!(doc.field("cvss_v31_severity").unwrap(), "CRITICAL");
        assert_eq!(doc.field("base_severity").unwrap(), "CRITICAL");
        assert_eq!(doc.field("last_modified").unwrap(), "2025-02-28T10:00:00.000");
        assert_eq!(doc.field("cwe_ids").unwrap(), &json!(["CWE-787"]));
        assert_eq!(doc.field("reference_count").unwrap(), 1);
        assert_eq!(doc.field("configurations").unwrap(), &json!([]));
        assert_eq!(doc.source_api(), "NVD CVE API");
    }

    #[test]
    fn missing_id_skips_only_that_item() {
        let mut items: Vec<Value> = (1..=5).map(|n| item(&format!("CVE-2025-000{n}"))).collect();
        items[2]["cve"].as_object_mut().unwrap().remove("id");

        let out = transform_cves(&items, &ctx());
        assert_eq!(out.documents.len(), 4);
        assert_eq!(out.errors, vec![TransformError::MissingId { index: 2, field: "cve.id" }]);
        assert!(out.documents.iter().all(|d| d.id() != ""));
    }

    #[test]
    fn empty_id_counts_as_missing() {
        let out = transform_cves(&[json!({"cve": {"id": "  "}})], &ctx());
        assert!(out.documents.is_empty());
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn bare_record_defaults() {
        let out = transform_cves(&[json!({"cve": {"id": "CVE-2025-9999"}})], &ctx());
        let doc = &out.documents[0];
        assert_eq!(doc.field("description").unwrap(), NO_DESCRIPTION);
        assert!(doc.field("cvss_v31_score").unwrap().is_null());
        assert!(doc.field("base_score").unwrap().is_null());
        assert_eq!(doc.field("references").unwrap(), &json!([]));
        assert_eq!(doc.field("metrics").unwrap(), &json!({}));
    }

    #[test]
    fn base_score_falls_back_to_older_cvss() {
        let v2_only = json!({"cve": {
            "id": "CVE-2010-0001",
            "metrics": {"cvssMetricV2": [{"cvssData": {"baseScore": 5.0}, "baseSeverity": "MEDIUM"}]}
        }});
        let out = transform_cves(&[v2_only], &ctx());
        let doc = &out.documents[0];
        assert!(doc.field("cvss_v31_score").unwrap().is_null());
        assert_eq!(doc.field("base_score").unwrap(), 5.0);
        assert_eq!(doc.field("base_severity").unwrap(), "MEDIUM");
    }

    #[test]
    fn description_needs_exact_lang() {
        let only_en_us = json!({"cve": {
            "id": "CVE-2025-0002",
            "descriptions": [{"lang": "en-US", "value": "Close, but no."}]
        }});
        let out = transform_cves(&[only_en_us], &ctx());
        assert_eq!(out.documents[0].field("description").unwrap(), NO_DESCRIPTION);
    }
}
