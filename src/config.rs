//! Configuration parsing and validation.
//!
//! Registry Mirror is configured via a TOML file (default:
//! `config/regsync.toml`). Only `[db]` is required; every other section
//! falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/registry.sqlite"
//!
//! [upstream]
//! base_url = "https://registry.modelcontextprotocol.io"
//! page_size = 100
//!
//! [sync]
//! run_timeout_secs = 900
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```
//!
//! # Environment Variables
//!
//! - `REGISTRY_BASE_URL` overrides `upstream.base_url`
//! - `SYNC_SECRET` overrides `server.trigger_secret`

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Largest page the upstream list endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Upper bound for every `*_secs` setting: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Base delay of the exponential backoff, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://registry.modelcontextprotocol.io".to_string()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_base_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Identifier of the sync job; keys the checkpoint and the lease.
    #[serde(default = "default_job")]
    pub job: String,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Subtracted from the watermark before it is sent upstream.
    #[serde(default = "default_watermark_margin_secs")]
    pub watermark_margin_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            job: default_job(),
            run_timeout_secs: default_run_timeout_secs(),
            watermark_margin_secs: default_watermark_margin_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_job() -> String {
    "official-registry".to_string()
}
fn default_run_timeout_secs() -> u64 {
    900
}
fn default_watermark_margin_secs() -> u64 {
    1
}
fn default_lease_ttl_secs() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required by `POST /api/sync`. Unset means no auth.
    #[serde(default)]
    pub trigger_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trigger_secret: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    /// Apply `REGISTRY_BASE_URL` and `SYNC_SECRET` if they are set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REGISTRY_BASE_URL") {
            if !url.trim().is_empty() {
                self.upstream.base_url = url.trim().to_string();
            }
        }
        if let Ok(secret) = std::env::var("SYNC_SECRET") {
            if !secret.is_empty() {
                self.server.trigger_secret = Some(secret);
            }
        }
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.upstream.page_size) {
            bail!("upstream.page_size must be in [1, {}]", MAX_PAGE_SIZE);
        }

        let base = self.upstream.base_url.as_str();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            bail!(
                "upstream.base_url must start with http:// or https://, got '{}'",
                base
            );
        }

        if self.upstream.timeout_secs == 0 {
            bail!("upstream.timeout_secs must be > 0");
        }

        if self.sync.job.trim().is_empty() {
            bail!("sync.job must not be empty");
        }

        if self.sync.run_timeout_secs == 0 {
            bail!("sync.run_timeout_secs must be > 0");
        }

        for (key, value) in [
            ("upstream.timeout_secs", self.upstream.timeout_secs),
            ("sync.run_timeout_secs", self.sync.run_timeout_secs),
            ("sync.watermark_margin_secs", self.sync.watermark_margin_secs),
            ("sync.lease_ttl_secs", self.sync.lease_ttl_secs),
        ] {
            if value > MAX_DURATION_SECS {
                bail!("{} must be <= {} (one year), got {}", key, MAX_DURATION_SECS, value);
            }
        }

        if self.sync.lease_ttl_secs < self.sync.run_timeout_secs {
            bail!(
                "sync.lease_ttl_secs ({}) must be >= sync.run_timeout_secs ({})",
                self.sync.lease_ttl_secs,
                self.sync.run_timeout_secs
            );
        }

        if matches!(&self.server.trigger_secret, Some(s) if s.is_empty()) {
            bail!("server.trigger_secret must not be empty when set");
        }

        Ok(())
    }
}

/// Parse a config string without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, apply environment overrides, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides();
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"./data/registry.sqlite\"\n").unwrap();
        assert_eq!(cfg.upstream.base_url, "https://registry.modelcontextprotocol.io");
        assert_eq!(cfg.upstream.page_size, 100);
        assert_eq!(cfg.sync.job, "official-registry");
        assert_eq!(cfg.server.bind, "127.0.0.1:7340");
        assert!(cfg.server.trigger_secret.is_none());
    }

    #[test]
    fn rejects_oversized_page() {
        let err = parse_config("[db]\npath = \"x.db\"\n[upstream]\npage_size = 250\n").unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn rejects_lease_shorter_than_run() {
        let err = parse_config(
            "[db]\npath = \"x.db\"\n[sync]\nrun_timeout_secs = 600\nlease_ttl_secs = 60\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));
    }

    #[test]
    fn rejects_durations_beyond_a_year() {
        let err = parse_config(
            "[db]\npath = \"x.db\"\n[sync]\nrun_timeout_secs = 1000000000000000\nlease_ttl_secs = 1000000000000000\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("sync.run_timeout_secs must be <="));

        let err = parse_config("[db]\npath = \"x.db\"\n[sync]\nwatermark_margin_secs = 18446744073709551615\n")
            .unwrap_err();
        assert!(err.to_string().contains("watermark_margin_secs"));

        let cfg = parse_config(&format!(
            "[db]\npath = \"x.db\"\n[sync]\nrun_timeout_secs = {0}\nlease_ttl_secs = {0}\n",
            MAX_DURATION_SECS
        ))
        .unwrap();
        assert_eq!(cfg.sync.lease_ttl_secs, MAX_DURATION_SECS);
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err =
            parse_config("[db]\npath = \"x.db\"\n[upstream]\nbase_url = \"ftp://mirror\"\n")
                .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }
}
