//! DNS query documents from DoH JSON responses.

use netharvest_common::{NormalizedDocument, TransformError};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{TransformContext, TransformOutcome};
use crate::models::{DnsResponse, SourceKind};

/// RCODE label for a DoH `Status`.
pub fn response_code_label(status: i64) -> &'static str {
    match status {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

pub fn transform_dns(responses: &[DnsResponse], ctx: &TransformContext) -> TransformOutcome {
    let mut out = TransformOutcome::default();

    for (index, resp) in responses.iter().enumerate() {
        match dns_document(index, resp, ctx) {
            Ok(doc) => out.documents.push(doc),
            Err(e) => {
                warn!(index, domain = %resp.queried_domain, error = %e, "DNS response skipped");
                out.errors.push(e);
            }
        }
    }

    debug!(documents = out.documents.len(), errors = out.errors.len(), "DNS responses transformed");
    out
}

fn dns_document(index: usize, resp: &DnsResponse, ctx: &TransformContext) -> Result<NormalizedDocument, TransformError> {
    let body = resp
        .body
        .as_object()
        .ok_or_else(|| TransformError::Malformed(format!("DNS response {index} is not a JSON object")))?;
    let domain = resp.queried_domain.trim();
    if domain.is_empty() {
        return Err(TransformError::MissingId { index, field: "queried_domain" });
    }

    let answers: Vec<Value> = body
        .get("Answer")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(answer_record).collect())
        .unwrap_or_default();

    let query_type = body
        .get("Question")
        .and_then(|q| q.get(0))
        .and_then(|q| q.get("type"))
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let status = body.get("Status").and_then(Value::as_i64).unwrap_or(-1);
    let flag = |key: &str| body.get(key).and_then(Value::as_bool).unwrap_or(false);

    let mut raw = resp.body.clone();
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("queried_domain".to_string(), Value::String(domain.to_string()));
    }

    let doc = ctx
        .document(format!("dns_{domain}_{}", ctx.stamp()), SourceKind::Doh, raw)?
        .with_field("query_name", domain)
        .with_field("query_type", query_type)
        .with_field("status", status)
        .with_field("response_code", response_code_label(status))
        .with_field("answer_count", answers.len())
        .with_field("answers", answers)
        .with_field("truncated", flag("TC"))
        .with_field("recursion_desired", flag("RD"))
        .with_field("recursion_available", flag("RA"))
        .with_field("authenticated_data", flag("AD"));
    Ok(doc)
}

fn answer_record(answer: &Value) -> Value {
    json!({
        "name": answer.get("name").and_then(Value::as_str).unwrap_or(""),
        "type": answer.get("type").and_then(Value::as_i64).unwrap_or(0),
        "ttl":  answer.get("TTL").and_then(Value::as_i64).unwrap_or(0),
        "data": answer.get("data").and_then(Value::as_str).unwrap_or(""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx() -> TransformContext {
        TransformContext::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), "2.0")
    }

    fn response(domain: &str, body: Value) -> DnsResponse {
        DnsResponse { queried_domain: domain.to_string(), body }
    }

    #[test]
    fn known_codes_and_unknown_fallback() {
        let table = ["NOERROR", "FORMERR", "SERVFAIL", "NXDOMAIN", "NOTIMP", "REFUSED"];
        for (code, label) in table.iter().enumerate() {
            assert_eq!(response_code_label(code as i64), *label);
        }
        for code in [-1, 6, 9, 23, i64::MAX] {
            assert_eq!(response_code_label(code), "UNKNOWN");
        }
    }

    #[test]
    fn answers_flags_and_question_type() {
        let body = json!({
            "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false,
            "Question": [{"name": "github.com", "type": 1}],
            "Answer": [
                {"name": "github.com", "type": 1, "TTL": 60, "data": "140.82.121.4"},
                {"name": "github.com", "type": 1, "TTL": 60}
            ]
        });
        let out = transform_dns(&[response("github.com", body.clone())], &ctx());
        let doc = &out.documents[0];

        assert_eq!(doc.id(), "dns_github.com_2025-03-01T12:00:00.000000+00:00");
        assert_eq!(doc.field("response_code").unwrap(), "NOERROR");
        assert_eq!(doc.field("answer_count").unwrap(), 2);
        assert_eq!(doc.field("answers").unwrap()[0]["ttl"], 60);
        assert_eq!(doc.field("answers").unwrap()[1]["data"], "");
        assert_eq!(doc.field("recursion_desired").unwrap(), true);
        assert_eq!(doc.field("truncated").unwrap(), false);
        assert_eq!(doc.raw_data()["queried_domain"], "github.com");
        assert_eq!(doc.raw_data()["Answer"], body["Answer"]);
    }

    #[test]
    fn sparse_body_takes_defaults() {
        let out = transform_dns(&[response("example.test", json!({}))], &ctx());
        let doc = &out.documents[0];
        assert_eq!(doc.field("status").unwrap(), -1);
        assert_eq!(doc.field("response_code").unwrap(), "UNKNOWN");
        assert_eq!(doc.field("query_type").unwrap(), 1);
        assert_eq!(doc.field("answer_count").unwrap(), 0);
    }

    #[test]
    fn non_object_body_is_an_item_error() {
        let responses = [response("a.test", json!("nope")), response("b.test", json!({"Status": 3}))];
        let out = transform_dns(&responses, &ctx());
        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.documents[0].field("response_code").unwrap(), "NXDOMAIN");
    }

    #[test]
    fn input_is_left_untouched() {
        let responses = vec![response("a.test", json!({"Status": 0}))];
        let before = responses.clone();
        transform_dns(&responses, &ctx());
        assert_eq!(responses, before);
    }
}
