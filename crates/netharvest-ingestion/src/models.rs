//! Raw payload models, one variant per upstream family.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Trace,
    Doh,
    Speed,
    Nvd,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [SourceKind::Trace, SourceKind::Doh, SourceKind::Speed, SourceKind::Nvd];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Trace => "trace",
            SourceKind::Doh   => "doh",
            SourceKind::Speed => "speed",
            SourceKind::Nvd   => "nvd",
        }
    }

    /// Value stamped on every document as `source_api`.
    pub fn source_api(&self) -> &'static str {
        match self {
            SourceKind::Trace => "Cloudflare Trace",
            SourceKind::Doh   => "Cloudflare DoH",
            SourceKind::Speed => "Cloudflare Speed Test",
            SourceKind::Nvd   => "NVD CVE API",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(SourceKind::Trace),
            "doh" | "dns" => Ok(SourceKind::Doh),
            "speed" => Ok(SourceKind::Speed),
            "nvd" | "cve" => Ok(SourceKind::Nvd),
            other => Err(format!("unknown source `{other}` (expected trace, doh, speed or nvd)")),
        }
    }
}

/// As-received output of one extractor run.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Decoded `key=value` lines, ordered by key.
    Trace(BTreeMap<String, String>),
    Dns(Vec<DnsResponse>),
    Speed(Vec<SpeedSample>),
    /// `vulnerabilities[]` entries accumulated across pages.
    CveFeed(Vec<Value>),
}

impl RawPayload {
    pub fn kind(&self) -> SourceKind {
        match self {
            RawPayload::Trace(_)   => SourceKind::Trace,
            RawPayload::Dns(_)     => SourceKind::Doh,
            RawPayload::Speed(_)   => SourceKind::Speed,
            RawPayload::CveFeed(_) => SourceKind::Nvd,
        }
    }

    pub fn item_count(&self) -> usize {
        match self {
            RawPayload::Trace(_)       => 1,
            RawPayload::Dns(items)     => items.len(),
            RawPayload::Speed(items)   => items.len(),
            RawPayload::CveFeed(items) => items.len(),
        }
    }
}

/// One DoH answer body together with the domain that was asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsResponse {
    pub queried_domain: String,
    pub body: Value,
}

/// One download measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    /// 1-based.
    pub iteration: u32,
    pub timestamp: String,
    pub data_size_bytes: u64,
    pub elapsed_time_seconds: f64,
    pub speed_mbps: f64,
    pub status_code: u16,
}
