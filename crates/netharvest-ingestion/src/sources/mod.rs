//! Upstream source extractors.

pub mod doh;
pub mod nvd;
pub mod speed;
pub mod trace;

pub use doh::DohExtractor;
pub use nvd::NvdExtractor;
pub use speed::SpeedExtractor;
pub use trace::TraceExtractor;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::fetcher::Fetcher;
use crate::models::{RawPayload, SourceKind};

/// Common interface for all upstream extractors.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Pull the raw payload for one run.
    ///
    /// `None` means the upstream could not be read at all. An upstream that
    /// answered with nothing yields an empty payload instead.
    async fn extract(&self, fetcher: &Fetcher) -> Option<RawPayload>;
}

/// Decode a `key=value` line format. Lines without `=` are skipped; only the
/// first `=` splits, and both sides are trimmed.
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_without_separator_are_dropped() {
        let map = parse_key_values("fl=12f\nnot a pair\nip = 203.0.113.7 \n\nuag=curl/8.0=beta\n");
        assert_eq!(map.len(), 3);
        assert_eq!(map["ip"], "203.0.113.7");
        assert_eq!(map["uag"], "curl/8.0=beta");
        assert!(!map.contains_key("not a pair"));
    }

    #[test]
    fn empty_body_decodes_to_empty_map() {
        assert!(parse_key_values("").is_empty());
    }
}
