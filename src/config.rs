//! Top-level configuration loaded from a TOML file.
//!
//! Mirrors the provider/limits/timeouts/paths split of spec §3 and §6: the
//! core treats configuration as a read-only typed accessor, never mutated
//! after load (reconfigure means reloading and swapping the whole `Config`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Usenet providers, in configured priority order (primaries first).
    pub providers: Vec<ProviderConfig>,
    /// Pool and streaming limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Per-operation timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Filesystem paths the core writes/reads through the blob store.
    pub paths: PathsConfig,
}

/// One configured Usenet provider.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    /// Unique name, also used as the pool's log/event tag.
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub max_connections: usize,
    /// Primary providers are tried before backups (spec §4.3 step 1).
    #[serde(default)]
    pub priority: ProviderPriority,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPriority {
    #[default]
    Primary,
    Backup,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Global cross-pool connection ceiling shared by every provider pool.
    #[serde(default = "default_global_connection_cap")]
    pub global_connection_cap: usize,
    /// Connections a single stream's prefetch scheduler may draw concurrently.
    #[serde(default = "default_connections_per_stream")]
    pub connections_per_stream: usize,
    /// Capacity of the global streaming limiter (spec §5).
    #[serde(default = "default_total_streaming_connections")]
    pub total_streaming_connections: usize,
    /// Prefetch buffer-window size, in segments, per stream.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Whether streaming reads may substitute zero-filled segments instead
    /// of failing (spec §4.5 / Open Question 2 in SPEC_FULL.md).
    #[serde(default)]
    pub graceful_degradation: bool,
    /// Bound on the composite-stream sub-stream cache (spec §4.6).
    #[serde(default = "default_composite_cache_size")]
    pub composite_cache_size: usize,
    /// Max age of a cached composite-stream sub-stream before it's evicted
    /// lazily on the next lookup, even with free capacity (spec §9 Open
    /// Question 3: cap *and* TTL, not cap alone).
    #[serde(default = "default_composite_cache_ttl_secs", with = "duration_secs")]
    pub composite_cache_ttl: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_connection_cap: default_global_connection_cap(),
            connections_per_stream: default_connections_per_stream(),
            total_streaming_connections: default_total_streaming_connections(),
            stream_buffer_size: default_stream_buffer_size(),
            graceful_degradation: false,
            composite_cache_size: default_composite_cache_size(),
            composite_cache_ttl: default_composite_cache_ttl_secs(),
        }
    }
}

fn default_global_connection_cap() -> usize {
    200
}
fn default_connections_per_stream() -> usize {
    8
}
fn default_total_streaming_connections() -> usize {
    64
}
fn default_stream_buffer_size() -> usize {
    16
}
fn default_composite_cache_size() -> usize {
    4
}
fn default_composite_cache_ttl_secs() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    /// Per-segment fetch deadline (spec §5: default 180s).
    #[serde(default = "default_segment_fetch_secs", with = "duration_secs")]
    pub segment_fetch: Duration,
    /// PAR2 descriptor-scan wall-clock cap (spec §5: default 3 minutes).
    #[serde(default = "default_par2_secs", with = "duration_secs")]
    pub par2_scan: Duration,
    /// Per-processor step cap (spec §5: default 5 minutes).
    #[serde(default = "default_processor_secs", with = "duration_secs")]
    pub processor_step: Duration,
    /// Idle timeout before the reaper destroys an idle pooled connection.
    #[serde(default = "default_idle_timeout_secs", with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            segment_fetch: default_segment_fetch_secs(),
            par2_scan: default_par2_secs(),
            processor_step: default_processor_secs(),
            idle_timeout: default_idle_timeout_secs(),
        }
    }
}

fn default_segment_fetch_secs() -> Duration {
    Duration::from_secs(180)
}
fn default_par2_secs() -> Duration {
    Duration::from_secs(180)
}
fn default_processor_secs() -> Duration {
    Duration::from_secs(300)
}
fn default_idle_timeout_secs() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root directory the file-system blob store writes NZB XML blobs under.
    pub blob_root: PathBuf,
    /// Root directory `.strm`/symlink shortcut emission targets (optional
    /// filesystem boundary from spec §6), if enabled.
    #[serde(default)]
    pub shortcut_root: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(CoreError::Config("no providers defined".into()));
        }
        if !self
            .providers
            .iter()
            .any(|p| p.priority == ProviderPriority::Primary)
        {
            return Err(CoreError::Config(
                "at least one primary provider is required".into(),
            ));
        }
        for p in &self.providers {
            if p.max_connections == 0 {
                return Err(CoreError::Config(format!(
                    "provider '{}': max_connections must be > 0",
                    p.name
                )));
            }
        }
        if self.limits.global_connection_cap == 0 {
            return Err(CoreError::Config("global_connection_cap must be > 0".into()));
        }
        Ok(())
    }

    /// Number of reserved slots background usage types must leave free
    /// (spec §4.1: `reserved = ceil(max/6)`, ~16% headroom for streaming).
    pub fn background_reservation(max_connections: usize) -> usize {
        max_connections.div_ceil(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_reservation_rounds_up() {
        assert_eq!(Config::background_reservation(6), 1);
        assert_eq!(Config::background_reservation(7), 2);
        assert_eq!(Config::background_reservation(1), 1);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [[providers]]
            name = "primary"
            host = "news.example.com"
            port = 563
            tls = true
            max_connections = 20

            [paths]
            blob_root = "/tmp/nntpvfs/blobs"
        "#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.limits.connections_per_stream, 8);
        assert_eq!(cfg.timeouts.segment_fetch, Duration::from_secs(180));
    }

    #[test]
    fn rejects_missing_primary() {
        let toml_src = r#"
            [[providers]]
            name = "backup"
            host = "b.example.com"
            port = 119
            max_connections = 5
            priority = "backup"

            [paths]
            blob_root = "/tmp/blobs"
        "#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert!(cfg.validate().is_err());
    }
}
