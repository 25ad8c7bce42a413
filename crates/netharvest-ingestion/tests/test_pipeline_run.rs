//! Full harvest runs against mock upstreams and the in-memory store.

use chrono::{DateTime, TimeZone, Utc};
use netharvest_config::Config;
use netharvest_db::{DocumentStore, FieldFilter, MemoryStore};
use netharvest_ingestion::fetcher::{Fetcher, ReqwestTransport, RetryPolicy};
use netharvest_ingestion::testing::RecordingSleeper;
use netharvest_ingestion::{Pipeline, SourceKind, Stage};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn fetcher() -> Fetcher {
    let transport = ReqwestTransport::new(Duration::from_secs(2), "netharvest-test/0.1").unwrap();
    Fetcher::new(
        Arc::new(transport),
        Arc::new(RecordingSleeper::default()),
        RetryPolicy::new(2, Duration::from_millis(5)),
    )
}

fn cve(id: Option<&str>, severity: &str) -> Value {
    let mut cve = json!({
        "sourceIdentifier": "cve@mitre.org",
        "lastModified": "2025-03-01T00:00:00.000",
        "descriptions": [{"lang": "en", "value": "Example flaw."}],
        "metrics": {"cvssMetricV31": [{"cvssData": {"baseScore": 7.5, "baseSeverity": severity}}]}
    });
    if let Some(id) = id {
        cve["id"] = json!(id);
    }
    json!({"cve": cve})
}

async fn mount_upstreams(server: &MockServer, severity: &str) {
    Mock::given(method("GET"))
        .and(path("/cdn-cgi/trace"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ip=203.0.113.9\ncolo=FRA\nwarp=on\n"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dns-query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Status": 0, "RD": true, "RA": true,
            "Question": [{"name": "example.test", "type": 1}],
            "Answer": [{"name": "example.test", "type": 1, "TTL": 120, "data": "192.0.2.44"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/__down"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4096]))
        .mount(server)
        .await;

    let items = vec![
        cve(Some("CVE-2025-1001"), severity),
        cve(Some("CVE-2025-1002"), severity),
        cve(None, severity),
        cve(Some("CVE-2025-1004"), severity),
        cve(Some("CVE-2025-1005"), severity),
    ];
    Mock::given(method("GET"))
        .and(path("/rest/json/cves/2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resultsPerPage": 5, "startIndex": 0, "totalResults": 5, "vulnerabilities": items
        })))
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.sources.trace.url = format!("{}/cdn-cgi/trace", server.uri());
    config.sources.doh.url = format!("{}/dns-query", server.uri());
    config.sources.doh.domains = vec!["example.test".to_string(), "example.org".to_string()];
    config.sources.speed.url = format!("{}/__down", server.uri());
    config.sources.speed.iterations = 2;
    config.sources.nvd.url = format!("{}/rest/json/cves/2.0", server.uri());
    config
}

#[tokio::test]
async fn test_full_run_loads_every_source() {
    let server = MockServer::start().await;
    mount_upstreams(&server, "HIGH").await;
    let store = Arc::new(MemoryStore::new());

    let pipeline = Pipeline::from_config(&config(&server), store.clone(), fetcher()).with_clock(fixed_clock);
    let report = pipeline.run().await.expect("store reachable");

    assert!(report.success, "sources: {:#?}", report.sources);
    assert_eq!(report.sources.len(), 4);

    let nvd = report.source(SourceKind::Nvd).unwrap();
    assert_eq!(nvd.documents, 4);
    assert_eq!(nvd.item_errors, 1);

    assert_eq!(store.count("cloudflare_trace_raw", None).await.unwrap(), 1);
    assert_eq!(store.count("cloudflare_doh_raw", None).await.unwrap(), 2);
    assert_eq!(store.count("cloudflare_speed_raw", None).await.unwrap(), 1);
    assert_eq!(store.count("nvd_cve_raw", None).await.unwrap(), 4);

    let trace = store.documents("cloudflare_trace_raw").remove(0);
    assert_eq!(trace["ip_address"], "203.0.113.9");
    assert_eq!(trace["warp"], "on");
    assert_eq!(trace["etl_version"], "2.0");
    assert_eq!(trace["source_api"], "Cloudflare Trace");
    assert_eq!(trace["ingestion_timestamp"], "2025-03-01T12:00:00.000000+00:00");

    let speed = store.documents("cloudflare_speed_raw").remove(0);
    assert_eq!(speed["test_count"], 2);

    let totals: Vec<(String, u64)> = report
        .collection_counts
        .iter()
        .map(|c| (c.collection.clone(), c.documents))
        .collect();
    assert!(totals.contains(&("nvd_cve_raw".to_string(), 4)));
}

#[tokio::test]
async fn test_rerun_upserts_cves_without_duplicates() {
    let store = Arc::new(MemoryStore::new());

    let first = MockServer::start().await;
    mount_upstreams(&first, "HIGH").await;
    let mut cfg = config(&first);
    cfg.sources.trace.enabled = false;
    cfg.sources.doh.enabled = false;
    cfg.sources.speed.enabled = false;
    Pipeline::from_config(&cfg, store.clone(), fetcher()).run().await.unwrap();

    let second = MockServer::start().await;
    mount_upstreams(&second, "CRITICAL").await;
    cfg.sources.nvd.url = format!("{}/rest/json/cves/2.0", second.uri());
    let report = Pipeline::from_config(&cfg, store.clone(), fetcher()).run().await.unwrap();

    let load = report.source(SourceKind::Nvd).and_then(|s| s.load.clone()).unwrap();
    assert_eq!((load.upserted, load.modified), (0, 4));
    assert_eq!(store.count("nvd_cve_raw", None).await.unwrap(), 4);
    let critical = FieldFilter::eq("base_severity", "CRITICAL");
    assert_eq!(store.count("nvd_cve_raw", Some(&critical)).await.unwrap(), 4);
}

#[tokio::test]
async fn test_dead_upstream_fails_its_source_only() {
    let server = MockServer::start().await;
    mount_upstreams(&server, "LOW").await;
    let mut cfg = config(&server);
    cfg.sources.speed.url = "http://127.0.0.1:9/__down".to_string();

    let store = Arc::new(MemoryStore::new());
    let report = Pipeline::from_config(&cfg, store.clone(), fetcher()).run().await.unwrap();

    assert!(!report.success);
    let speed = report.source(SourceKind::Speed).unwrap();
    assert_eq!(speed.failed_stage, Some(Stage::Extract));
    assert!(report.source(SourceKind::Trace).unwrap().success);
    assert!(report.source(SourceKind::Nvd).unwrap().success);
    assert_eq!(store.count("cloudflare_speed_raw", None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unreachable_store_is_fatal() {
    let server = MockServer::start().await;
    mount_upstreams(&server, "LOW").await;
    let store = Arc::new(MemoryStore::unreachable());

    let err = Pipeline::from_config(&config(&server), store, fetcher()).run().await.unwrap_err();
    assert!(err.to_string().contains("memory://"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}
