//! Cloudflare trace endpoint.
//!
//! Endpoint: https://1.1.1.1/cdn-cgi/trace
//! Body is plain text, one `key=value` per line (ip, ts, colo, loc, tls, ...).

use async_trait::async_trait;
use netharvest_config::TraceSourceConfig;
use tracing::{info, instrument, warn};

use super::{parse_key_values, SourceExtractor};
use crate::fetcher::{FetchRequest, Fetcher};
use crate::models::{RawPayload, SourceKind};

pub struct TraceExtractor {
    url: String,
}

impl TraceExtractor {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(cfg: &TraceSourceConfig) -> Self {
        Self::new(cfg.url.clone())
    }
}

#[async_trait]
impl SourceExtractor for TraceExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Trace
    }

    #[instrument(skip_all, fields(source = "trace", stage = "extract"))]
    async fn extract(&self, fetcher: &Fetcher) -> Option<RawPayload> {
        let body = match fetcher.fetch(&FetchRequest::get(&self.url)).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Trace extraction failed");
                return None;
            }
        };

        let fields = parse_key_values(&body.text());
        info!(fields = fields.len(), "Trace data extracted");
        Some(RawPayload::Trace(fields))
    }
}
