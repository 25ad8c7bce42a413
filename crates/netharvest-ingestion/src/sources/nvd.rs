//! NVD CVE API 2.0 client.
//!
//! API docs: https://nvd.nist.gov/developers/vulnerabilities
//! Endpoint: https://services.nvd.nist.gov/rest/json/cves/2.0
//!
//! Pages through `vulnerabilities[]` with `startIndex` / `resultsPerPage`,
//! restricted to a trailing `lastModStartDate`..`lastModEndDate` window.
//! The server may return fewer records than asked for, so the next
//! `startIndex` follows what was actually received.
//! An `apiKey` header, when configured, allows a much shorter page delay.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use netharvest_config::{NvdSourceConfig, NVD_MAX_PAGE_SIZE};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::SourceExtractor;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::models::{RawPayload, SourceKind};

/// NVD wants extended ISO-8601 with milliseconds.
const NVD_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub struct NvdExtractor {
    url: String,
    api_key: Option<SecretString>,
    page_size: u32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    page_delay: Duration,
}

impl NvdExtractor {
    /// Window ends at `now` and reaches back `cfg.window_hours`.
    pub fn from_config(cfg: &NvdSourceConfig, now: DateTime<Utc>) -> Self {
        Self {
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            page_size: cfg.page_size.clamp(1, NVD_MAX_PAGE_SIZE),
            window_start: now - ChronoDuration::hours(i64::from(cfg.window_hours)),
            window_end: now,
            page_delay: cfg.effective_page_delay(),
        }
    }

    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.window_start, self.window_end)
    }

    fn page_request(&self, start_index: u64) -> FetchRequest {
        let req = FetchRequest::get(&self.url)
            .param("startIndex", start_index)
            .param("resultsPerPage", self.page_size)
            .param("lastModStartDate", self.window_start.format(NVD_DATE_FORMAT))
            .param("lastModEndDate", self.window_end.format(NVD_DATE_FORMAT));
        match &self.api_key {
            Some(key) => req.header("apiKey", key.expose_secret()),
            None => req,
        }
    }
}

#[async_trait]
impl SourceExtractor for NvdExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Nvd
    }

    #[instrument(skip_all, fields(source = "nvd", stage = "extract"))]
    async fn extract(&self, fetcher: &Fetcher) -> Option<RawPayload> {
        let mut offset: u64 = 0;
        let mut items: Vec<Value> = Vec::new();

        loop {
            let page: Value = match fetcher.fetch(&self.page_request(offset)).await {
                Ok(body) => match body.json() {
                    Ok(v) => v,
                    Err(e) => {
                        error!(offset, error = %e, "NVD page unreadable, abandoning feed");
                        return None;
                    }
                },
                Err(e) => {
                    error!(offset, error = %e, "NVD page failed, abandoning feed");
                    return None;
                }
            };

            let vulns = page["vulnerabilities"].as_array().cloned().unwrap_or_default();
            let total = page["totalResults"].as_u64().unwrap_or(0);
            debug!(offset, received = vulns.len(), total, "NVD page");

            let received = vulns.len() as u64;
            items.extend(vulns);

            offset += received;
            if received == 0 || offset >= total {
                break;
            }
            fetcher.pause(self.page_delay).await;
        }

        info!(records = items.len(), "NVD feed extracted");
        Some(RawPayload::CveFeed(items))
    }
}
