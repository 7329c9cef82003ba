//! Configuration loading for voxweave.
//!
//! A single TOML file with serde defaults for every tunable, plus
//! environment-variable overrides for secrets and connection strings so
//! deployments never have to write credentials to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub provider: ProviderConfig,
    pub monitor: MonitorConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    /// Speaker tag → provider voice identifier. Tags form the closed set
    /// the dialogue parser recognizes; an empty voice id means the speaker
    /// exists but cannot be synthesized.
    pub speakers: BTreeMap<String, String>,
}

/// Orchestration tunables (concurrency, strategy, retries, lifecycles).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global ceiling on concurrently running tasks, fleet-wide.
    pub max_concurrent_tasks: u32,
    /// Parallel batch size within one task.
    pub max_concurrent_segments: usize,
    /// Maximum dialogue turns packed into one segment.
    pub max_turns_per_segment: usize,
    /// Character count at (and above) which the PARALLEL strategy is used.
    pub long_text_threshold: usize,
    /// Maximum accepted submission length in characters.
    pub max_text_chars: usize,
    /// Linear backoff base between segment attempts, in seconds.
    pub segment_retry_delay_base_secs: u64,
    /// Attempts per segment.
    pub segment_max_retries: u32,
    /// PROCESSING tasks older than this are swept to TIMEOUT.
    pub task_timeout_seconds: u64,
    /// How long a queued task may wait for a global slot.
    pub queue_wait_timeout_seconds: u64,
    /// Terminal tasks are evicted from the hot map after this long.
    pub terminal_retention_seconds: u64,
    /// Content-hash dedup window.
    pub idempotency_ttl_seconds: u64,
    /// Timeout sweeper cadence.
    pub sweep_interval_seconds: u64,
    /// Wall-clock TTL on a held global slot; renewed while the task runs.
    pub slot_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_concurrent_segments: 10,
            max_turns_per_segment: 10,
            long_text_threshold: 2000,
            max_text_chars: 50_000,
            segment_retry_delay_base_secs: 1,
            segment_max_retries: 3,
            task_timeout_seconds: 1800,
            queue_wait_timeout_seconds: 600,
            terminal_retention_seconds: 3600,
            idempotency_ttl_seconds: 86_400,
            sweep_interval_seconds: 60,
            slot_ttl_seconds: 1800,
        }
    }
}

/// Streaming TTS provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// WebSocket endpoint, e.g. `wss://tts.example.com/api/v3/bidirection`.
    pub endpoint: String,
    pub app_id: String,
    pub access_token: String,
    pub connect_timeout_secs: u64,
    /// Allowed gap between received frames.
    pub idle_timeout_secs: u64,
    /// Per-session ceiling.
    pub total_timeout_secs: u64,
    /// Output codec. Byte concatenation across segments is asserted for
    /// "mp3" only.
    pub format: String,
    pub sample_rate: u32,
    /// Provider status codes treated as retryable. The provider does not
    /// publish the full enumeration, so the set stays configurable.
    pub transient_error_codes: Vec<i32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.bytedance.com/api/v3/tts/bidirection".into(),
            app_id: String::new(),
            access_token: String::new(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 30,
            total_timeout_secs: 120,
            format: "mp3".into(),
            sample_rate: 24_000,
            transient_error_codes: vec![45000001, 45000002],
        }
    }
}

/// Shared task-state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub redis_url: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".into(),
        }
    }
}

/// Blob store and relational index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object-store base URL. Empty selects the local filesystem store.
    pub base_url: String,
    pub bucket: String,
    pub token: String,
    pub public_read: bool,
    /// Root directory for the filesystem object store.
    pub local_dir: String,
    /// SQLite database path for the texts/audios index.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bucket: "voxweave".into(),
            token: String::new(),
            public_read: true,
            local_dir: "data/objects".into(),
            db_path: "voxweave.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// SSE subscriptions close after this long without an event.
    pub sse_idle_timeout_secs: u64,
    pub sse_keepalive_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            sse_idle_timeout_secs: 300,
            sse_keepalive_secs: 15,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides. A missing file yields pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        if config.speakers.is_empty() {
            config.speakers = default_speakers();
        }
        Ok(config)
    }

    /// Secrets and connection strings can come from the environment so they
    /// never land in the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("VOXWEAVE_REDIS_URL") {
            if !url.is_empty() {
                self.monitor.redis_url = url;
            }
        }
        if let Ok(app_id) = std::env::var("VOXWEAVE_APP_ID") {
            if !app_id.is_empty() {
                self.provider.app_id = app_id;
            }
        }
        if let Ok(token) = std::env::var("VOXWEAVE_ACCESS_TOKEN") {
            if !token.is_empty() {
                self.provider.access_token = token;
            }
        }
        if let Ok(token) = std::env::var("VOXWEAVE_STORAGE_TOKEN") {
            if !token.is_empty() {
                self.storage.token = token;
            }
        }
    }
}

/// Two-host default cast, used when the config file names no speakers.
fn default_speakers() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("A".to_string(), "zh_female_shuangkuaisisi_moon_bigtts".to_string()),
        ("B".to_string(), "zh_male_wennuanahu_moon_bigtts".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.engine.max_concurrent_tasks, 5);
        assert_eq!(config.engine.max_concurrent_segments, 10);
        assert_eq!(config.engine.max_turns_per_segment, 10);
        assert_eq!(config.engine.long_text_threshold, 2000);
        assert_eq!(config.engine.segment_max_retries, 3);
        assert_eq!(config.engine.task_timeout_seconds, 1800);
        assert_eq!(config.engine.idempotency_ttl_seconds, 86_400);
        assert_eq!(config.provider.connect_timeout_secs, 10);
        assert_eq!(config.provider.idle_timeout_secs, 30);
        assert_eq!(config.provider.total_timeout_secs, 120);
        assert_eq!(config.provider.sample_rate, 24_000);
        assert_eq!(config.provider.format, "mp3");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let raw = r#"
            [engine]
            max_concurrent_tasks = 2
            long_text_threshold = 500

            [speakers]
            host = "en_male_host_moon_bigtts"
            guest = "en_female_guest_moon_bigtts"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.engine.max_concurrent_tasks, 2);
        assert_eq!(config.engine.long_text_threshold, 500);
        // Untouched keys keep their defaults.
        assert_eq!(config.engine.segment_max_retries, 3);
        assert_eq!(config.speakers.len(), 2);
        assert_eq!(
            config.speakers.get("host").map(String::as_str),
            Some("en_male_host_moon_bigtts")
        );
    }

    #[test]
    fn missing_file_yields_defaults_with_speakers() {
        let config = Config::load(None).unwrap();
        assert!(!config.speakers.is_empty());
    }

    #[test]
    fn transient_codes_default_nonempty() {
        let config = Config::default();
        assert!(config
            .provider
            .transient_error_codes
            .contains(&45000001));
    }
}
