use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub send: SendConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Long-poll timeout handed to the homeserver for incremental syncs.
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra time on top of `timeout_ms` before a wedged request is abandoned.
    #[serde(default = "default_request_slack_ms")]
    pub request_slack_ms: u64,
    #[serde(default = "default_timeline_limit")]
    pub timeline_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sync_timeout_ms(),
            request_slack_ms: default_request_slack_ms(),
            timeline_limit: default_timeline_limit(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Total budget for one sync request, long poll included.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.saturating_add(self.request_slack_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConfig {
    /// Delay used when a rate-limit response carries no `retry_after_ms`.
    #[serde(default = "default_retry_after_ms")]
    pub default_retry_after_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            default_retry_after_ms: default_retry_after_ms(),
        }
    }
}

impl SendConfig {
    #[must_use]
    pub const fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Entries read per storage round trip, and the size of the initial window.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Default pagination `limit` for gap fills.
    #[serde(default = "default_gap_fill_amount")]
    pub gap_fill_amount: u32,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            gap_fill_amount: default_gap_fill_amount(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Subscriber settings for [`crate::telemetry::init_tracing`]. The
/// `THREADLINE_LOG` and `THREADLINE_LOG_FORMAT` variables override both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directives.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

/// Load a client config from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        return Ok(ClientConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ClientConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load `threadline/config.toml` from the platform config directory.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<ClientConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ClientConfig::default());
    };

    load_config(&config_dir.join("threadline/config.toml"))
}

const fn default_sync_timeout_ms() -> u64 {
    30_000
}

const fn default_request_slack_ms() -> u64 {
    80_000
}

const fn default_timeline_limit() -> u32 {
    10
}

const fn default_initial_delay_ms() -> u64 {
    2_000
}

const fn default_max_delay_ms() -> u64 {
    5 * 60 * 1_000
}

const fn default_probe_timeout_ms() -> u64 {
    30_000
}

const fn default_retry_after_ms() -> u64 {
    5_000
}

const fn default_page_size() -> usize {
    50
}

const fn default_gap_fill_amount() -> u32 {
    20
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}
