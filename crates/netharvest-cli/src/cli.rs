//! Command-line arguments and how they adjust the loaded configuration.

use clap::{Parser, ValueEnum};
use netharvest_config::Config;
use netharvest_ingestion::SourceKind;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "netharvest")]
#[command(author, version, about = "Harvest Cloudflare network probes and NVD CVE records into a document store", long_about = None)]
pub struct Cli {
    /// Config file (toml, yaml or json). Defaults to $NETHARVEST_CONFIG, then ./netharvest.toml
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run only these sources (trace, doh, speed, nvd)
    #[arg(long, value_delimiter = ',', value_name = "SOURCE")]
    pub only: Vec<SourceKind>,

    /// Skip these sources
    #[arg(long, value_delimiter = ',', value_name = "SOURCE")]
    pub skip: Vec<SourceKind>,

    /// Domain to resolve over DoH; repeat to query several
    #[arg(long = "dns-domain", value_name = "DOMAIN")]
    pub dns_domains: Vec<String>,

    /// Number of speed test downloads
    #[arg(long, value_name = "N")]
    pub speed_iterations: Option<u32>,

    /// Trailing lastModified window for the CVE feed
    #[arg(long, value_name = "HOURS")]
    pub nvd_window_hours: Option<u32>,

    /// Keep documents in memory instead of writing to Postgres
    #[arg(long)]
    pub dry_run: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "NETHARVEST_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Layer the flags over `config`. `--only` is applied before `--skip`.
    pub fn apply(&self, config: &mut Config) {
        if !self.only.is_empty() {
            for kind in SourceKind::ALL {
                set_enabled(config, kind, self.only.contains(&kind));
            }
        }
        for kind in &self.skip {
            set_enabled(config, *kind, false);
        }
        if !self.dns_domains.is_empty() {
            config.sources.doh.domains = self.dns_domains.clone();
        }
        if let Some(n) = self.speed_iterations {
            config.sources.speed.iterations = n;
        }
        if let Some(hours) = self.nvd_window_hours {
            config.sources.nvd.window_hours = hours;
        }
    }
}

fn set_enabled(config: &mut Config, kind: SourceKind, enabled: bool) {
    let s = &mut config.sources;
    match kind {
        SourceKind::Trace => s.trace.enabled = enabled,
        SourceKind::Doh   => s.doh.enabled = enabled,
        SourceKind::Speed => s.speed.enabled = enabled,
        SourceKind::Nvd   => s.nvd.enabled = enabled,
    }
}
