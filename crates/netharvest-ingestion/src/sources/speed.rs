//! Cloudflare speed test download endpoint.
//!
//! Endpoint: https://speed.cloudflare.com/__down[?bytes=<n>]
//!
//! Each iteration downloads the body once and records its size and the wall
//! time of the successful attempt.

use async_trait::async_trait;
use chrono::Utc;
use netharvest_common::iso_timestamp;
use netharvest_config::SpeedSourceConfig;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::SourceExtractor;
use crate::fetcher::{Body, FetchRequest, Fetcher};
use crate::models::{RawPayload, SourceKind, SpeedSample};
use crate::normalise::round_to;

pub struct SpeedExtractor {
    url: String,
    iterations: u32,
    bytes: Option<u64>,
    item_delay: Duration,
}

impl SpeedExtractor {
    pub fn new(url: impl Into<String>, iterations: u32) -> Self {
        Self {
            url: url.into(),
            iterations,
            bytes: None,
            item_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(cfg: &SpeedSourceConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            iterations: cfg.iterations,
            bytes: cfg.bytes,
            item_delay: Duration::from_millis(cfg.item_delay_ms),
        }
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    fn request(&self) -> FetchRequest {
        let req = FetchRequest::get(&self.url);
        match self.bytes {
            Some(n) => req.param("bytes", n),
            None => req,
        }
    }
}

/// Mbps = bytes × 8 / (seconds × 10⁶).
pub fn sample_from_body(iteration: u32, body: &Body) -> SpeedSample {
    let bytes = body.len() as u64;
    let secs = body.elapsed().as_secs_f64();
    let mbps = if secs > 0.0 { (bytes as f64 * 8.0) / (secs * 1_000_000.0) } else { 0.0 };

    SpeedSample {
        iteration,
        timestamp: iso_timestamp(Utc::now()),
        data_size_bytes: bytes,
        elapsed_time_seconds: round_to(secs, 3),
        speed_mbps: round_to(mbps, 2),
        status_code: body.status(),
    }
}

#[async_trait]
impl SourceExtractor for SpeedExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Speed
    }

    #[instrument(skip_all, fields(source = "speed", stage = "extract", iterations = self.iterations))]
    async fn extract(&self, fetcher: &Fetcher) -> Option<RawPayload> {
        let req = self.request();
        let mut samples = Vec::with_capacity(self.iterations as usize);

        for iteration in 1..=self.iterations {
            if iteration > 1 {
                fetcher.pause(self.item_delay).await;
            }
            match fetcher.fetch(&req).await {
                Ok(body) => {
                    let sample = sample_from_body(iteration, &body);
                    info!(iteration, speed_mbps = sample.speed_mbps, bytes = sample.data_size_bytes, "Speed sample");
                    samples.push(sample);
                }
                Err(e) => warn!(iteration, error = %e, "Speed test iteration failed"),
            }
        }

        if samples.is_empty() && self.iterations > 0 {
            warn!("Every speed test iteration failed");
            return None;
        }
        info!(completed = samples.len(), "Speed tests completed");
        Some(RawPayload::Speed(samples))
    }
}
