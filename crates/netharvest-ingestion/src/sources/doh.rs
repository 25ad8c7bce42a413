//! Cloudflare DNS-over-HTTPS (JSON API).
//!
//! Endpoint: https://cloudflare-dns.com/dns-query?name=<domain>&type=<rr>
//! Header:   Accept: application/dns-json
//!
//! One request per domain, paced by a fixed delay. A domain whose request
//! fails or whose body is not JSON is logged and left out. Repeated domains
//! are queried once, since their documents would share an id.

use async_trait::async_trait;
use netharvest_config::DohSourceConfig;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::SourceExtractor;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::models::{DnsResponse, RawPayload, SourceKind};

const DNS_JSON: &str = "application/dns-json";

pub struct DohExtractor {
    url: String,
    domains: Vec<String>,
    record_type: String,
    item_delay: Duration,
}

impl DohExtractor {
    pub fn new(url: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            url: url.into(),
            domains: distinct(domains),
            record_type: "A".to_string(),
            item_delay: Duration::from_millis(500),
        }
    }

    pub fn from_config(cfg: &DohSourceConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            domains: distinct(cfg.domains.clone()),
            record_type: cfg.record_type.clone(),
            item_delay: Duration::from_millis(cfg.item_delay_ms),
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    async fn query(&self, fetcher: &Fetcher, domain: &str) -> Option<DnsResponse> {
        let req = FetchRequest::get(&self.url)
            .param("name", domain)
            .param("type", &self.record_type)
            .header("Accept", DNS_JSON);

        let body = match fetcher.fetch(&req).await {
            Ok(body) => body,
            Err(e) => {
                warn!(domain, error = %e, "DNS query failed");
                return None;
            }
        };
        match body.json::<Value>() {
            Ok(json) => {
                debug!(domain, "DNS query answered");
                Some(DnsResponse { queried_domain: domain.to_string(), body: json })
            }
            Err(e) => {
                warn!(domain, error = %e, "DNS response discarded");
                None
            }
        }
    }
}

#[async_trait]
impl SourceExtractor for DohExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Doh
    }

    #[instrument(skip_all, fields(source = "doh", stage = "extract", domains = self.domains.len()))]
    async fn extract(&self, fetcher: &Fetcher) -> Option<RawPayload> {
        let mut responses = Vec::with_capacity(self.domains.len());

        for (i, domain) in self.domains.iter().enumerate() {
            if i > 0 {
                fetcher.pause(self.item_delay).await;
            }
            if let Some(resp) = self.query(fetcher, domain).await {
                responses.push(resp);
            }
        }

        if responses.is_empty() && !self.domains.is_empty() {
            warn!("Every DNS query failed");
            return None;
        }
        info!(answered = responses.len(), requested = self.domains.len(), "DNS data extracted");
        Some(RawPayload::Dns(responses))
    }
}

/// First occurrence wins; order is kept.
fn distinct(domains: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    domains.into_iter().filter(|d| seen.insert(d.clone())).collect()
}
