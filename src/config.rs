//! Configuration loading and validation.
//!
//! Configuration lives in a single JSON file. Every section carries
//! defaults so a partial file stays usable; credentials and partitions have
//! no sensible defaults and are checked by [`AppConfig::validate`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::identifier::Partition;
use crate::report::ReporterConfig;
use crate::resilience::{Backoff, BreakerConfig, RetryPolicy};

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub origin: OriginConfig,
    pub auth: AuthConfig,
    pub partitions: Vec<Partition>,
    pub retry: RetrySettings,
    pub breaker: BreakerConfig,
    pub pacing: PacingConfig,
    pub scan: ScanConfig,
    pub concurrency: ConcurrencyConfig,
    pub reporting: ReporterConfig,
    pub logging: LoggingConfig,
    /// Snapshot file used by the JSON-backed store.
    pub store_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: OriginConfig::default(),
            auth: AuthConfig::default(),
            partitions: Vec::new(),
            retry: RetrySettings::default(),
            breaker: BreakerConfig::default(),
            pacing: PacingConfig::default(),
            scan: ScanConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            reporting: ReporterConfig::default(),
            logging: LoggingConfig::default(),
            store_path: PathBuf::from("harvest-state.json"),
        }
    }
}

/// Origin endpoint and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// The origin serves a certificate chain that does not validate; the
    /// transport accepts it the way a browser user clicking through would.
    pub accept_invalid_certs: bool,
    /// Per-session request ceiling enforced by the pacing limiter.
    pub max_requests_per_second: u32,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
            timeout_secs: 30,
            accept_invalid_certs: true,
            max_requests_per_second: 2,
        }
    }
}

/// Login credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub login: String,
    pub password: String,
}

/// Retry policies per operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Transport-level policy; the only layer that reports to the breaker.
    pub http: RetryPolicy,
    /// Whole-login retries; each attempt recreates the transport.
    pub authentication: RetryPolicy,
    /// Whole-search retries above the transport layer.
    pub search: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            http: RetryPolicy::default(),
            authentication: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 2_000,
                backoff_multiplier: 2.0,
                max_delay_ms: 60_000,
                jitter: true,
                backoff: Backoff::Exponential,
            },
            search: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 1_000,
                backoff_multiplier: 2.0,
                max_delay_ms: 15_000,
                jitter: true,
                backoff: Backoff::Exponential,
            },
        }
    }
}

/// Fixed pacing delays, distinct from retry backoff: these respect the
/// origin's render latency and anti-abuse tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Pause between login steps.
    pub auth_step_delay_ms: u64,
    /// Pause between a stateful query POST and the result fetch.
    pub render_delay_ms: u64,
    /// Pause between consecutive searches within one partition.
    pub request_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            auth_step_delay_ms: 1_000,
            render_delay_ms: 500,
            request_delay_ms: 2_000,
        }
    }
}

impl PacingConfig {
    pub fn auth_step_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.auth_step_delay_ms)
    }

    pub fn render_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.render_delay_ms)
    }

    pub fn request_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_delay_ms)
    }
}

/// Forward-scan bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub year: String,
    /// Override the scan starting point; defaults to the store's last
    /// persisted number plus one.
    pub start_from: Option<u32>,
    pub max_number: u32,
    /// Consecutive empty results that end a partition's scan.
    pub max_consecutive_empty: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            year: "2025".to_string(),
            start_from: None,
            max_number: 9_999,
            max_consecutive_empty: 50,
        }
    }
}

/// Worker-pool sizing and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Partitions processed at once; sized to what the origin tolerates.
    pub max_parallel_regions: usize,
    /// Whole-worker restarts (fresh session, fresh auth) before a partition
    /// is marked failed for the run.
    pub worker_restart_attempts: u32,
    /// Mid-search re-authentication attempts within one worker lifetime.
    pub max_reauth_attempts: u32,
    /// Grace period for in-flight work after shutdown is requested.
    pub shutdown_grace_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_regions: 3,
            worker_restart_attempts: 2,
            max_reauth_attempts: 2,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ConcurrencyConfig {
    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,
    pub file_output: bool,
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_output: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), partitions = config.partitions.len(),
              "configuration loaded");
        Ok(config)
    }

    /// Check the fields no default can supply.
    pub fn validate(&self) -> Result<()> {
        if self.origin.base_url.is_empty() {
            anyhow::bail!("origin.base_url is required");
        }
        url::Url::parse(&self.origin.base_url)
            .with_context(|| format!("origin.base_url is not a valid URL: {}", self.origin.base_url))?;
        if self.auth.login.is_empty() || self.auth.password.is_empty() {
            anyhow::bail!("auth.login and auth.password are required");
        }
        if self.partitions.is_empty() {
            anyhow::bail!("at least one partition must be configured");
        }
        let mut keys: Vec<&str> = self.partitions.iter().map(|p| p.key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.len() != self.partitions.len() {
            anyhow::bail!("partition keys must be unique");
        }
        if self.concurrency.max_parallel_regions == 0 {
            anyhow::bail!("concurrency.max_parallel_regions must be at least 1");
        }
        if self.origin.max_requests_per_second == 0 {
            anyhow::bail!("origin.max_requests_per_second must be at least 1");
        }
        Ok(())
    }

    /// Look up a partition by key.
    pub fn partition(&self, key: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.key == key)
    }
}
