use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secrets::ApiKeySource;
use crate::upload::{CircuitBreakerConfig, OrchestratorConfig, RecoveryConfig, ThroughputTier};

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,

    /// Overrides the default `~/.shelfsync/data/shelfsync.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub recovery: RecoverySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            library: LibraryConfig::default(),
            remote: RemoteConfig::default(),
            upload: UploadConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directory scanned when `scan` is given no path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Lower-case extensions eligible for upload.
    pub extensions: Vec<String>,
    /// Glob patterns, matched against paths relative to the root.
    pub exclude: Vec<String>,
    pub include_hidden: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: None,
            extensions: ["pdf", "txt", "md", "docx", "html", "csv", "json"]
                .into_iter()
                .map(String::from)
                .collect(),
            exclude: Vec::new(),
            include_hidden: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Display name of the destination store.
    pub store: String,
    pub base_url: String,
    /// `free`, `tier1`, `tier2`, `tier3`, or a requests-per-minute number.
    pub tier: String,
    #[serde(flatten)]
    pub credentials: ApiKeySource,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            store: "shelfsync-library".to_string(),
            base_url: crate::remote::http::DEFAULT_BASE_URL.to_string(),
            tier: "tier1".to_string(),
            credentials: ApiKeySource::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub batch_size: usize,
    pub max_upload_concurrency: usize,
    pub poll_concurrency: usize,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub file_active_timeout_secs: u64,
    /// Permanent failures after which a file stops being retried.
    pub quarantine_after: u32,
    pub lock_ttl_secs: u64,
    /// Caps the number of pending files loaded per run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_upload_concurrency: 5,
            poll_concurrency: 20,
            poll_interval_secs: 5,
            poll_timeout_secs: 600,
            file_active_timeout_secs: 120,
            quarantine_after: 3,
            lock_ttl_secs: 3600,
            max_files: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub window_size: usize,
    pub error_rate_threshold: f64,
    pub min_samples: usize,
    pub consecutive_threshold: u32,
    pub cooldown_secs: u64,
    pub recovery_increment: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            window_size: defaults.window_size,
            error_rate_threshold: defaults.error_rate_threshold,
            min_samples: defaults.min_samples,
            consecutive_threshold: defaults.consecutive_threshold,
            cooldown_secs: defaults.cooldown.as_secs(),
            recovery_increment: defaults.recovery_increment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoverySettings {
    pub timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub danger_window_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let defaults = RecoveryConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            poll_timeout_secs: defaults.poll_timeout.as_secs(),
            poll_interval_secs: defaults.poll_interval.as_secs(),
            danger_window_secs: defaults.danger_window.as_secs(),
        }
    }
}

impl Config {
    /// Throughput tier named by `remote.tier`. Validated on load.
    pub fn tier(&self) -> ThroughputTier {
        self.remote.tier.parse().unwrap_or(ThroughputTier::Tier1)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let b = &self.circuit_breaker;
        CircuitBreakerConfig {
            window_size: b.window_size,
            error_rate_threshold: b.error_rate_threshold,
            min_samples: b.min_samples,
            consecutive_threshold: b.consecutive_threshold,
            cooldown: Duration::from_secs(b.cooldown_secs),
            recovery_increment: b.recovery_increment,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let u = &self.upload;
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            batch_size: u.batch_size,
            max_upload_concurrency: u.max_upload_concurrency,
            poll_concurrency: u.poll_concurrency,
            poll_interval: Duration::from_secs(u.poll_interval_secs),
            poll_timeout: Duration::from_secs(u.poll_timeout_secs),
            file_active_timeout: Duration::from_secs(u.file_active_timeout_secs),
            max_files: u.max_files.unwrap_or(defaults.max_files),
            tier: self.tier(),
            breaker: self.breaker_config(),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let r = &self.recovery;
        RecoveryConfig {
            timeout: Duration::from_secs(r.timeout_secs),
            poll_timeout: Duration::from_secs(r.poll_timeout_secs),
            poll_interval: Duration::from_secs(r.poll_interval_secs),
            danger_window: Duration::from_secs(r.danger_window_secs),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.upload.lock_ttl_secs)
    }
}
