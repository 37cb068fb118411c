//! Configuration management for the recognition orchestrator.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Longest result lifetime the cache will store (100 years)
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub recognition: RecognitionConfig,

    #[serde(default)]
    pub backends: BackendsConfig,

    #[serde(default)]
    pub privacy: PrivacyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether recognition is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Time each backend gets before the next one is tried
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Delay before the one-off "still working" notification
    #[serde(default = "default_progress_threshold")]
    pub progress_threshold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 15_000,
            progress_threshold_ms: 5_000,
        }
    }
}

impl TimingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn progress_threshold(&self) -> Duration {
        Duration::from_millis(self.progress_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the result cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lifetime of a cached result
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,

    /// Entries kept before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Database path; defaults to the user data directory
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_entries: 1000,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Result lifetime, capped at `MAX_CACHE_TTL`
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds).min(MAX_CACHE_TTL)
    }

    /// Resolve the database location
    pub fn db_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vision-navigator")
                .join("recognition_cache.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Average confidence below this marks a result partial_success
    #[serde(default = "default_threshold")]
    pub partial_threshold: f32,

    /// Elements below this confidence need confirmation before activation
    #[serde(default = "default_threshold")]
    pub activation_threshold: f32,

    /// Confidence assumed when a backend omits it
    #[serde(default = "default_confidence")]
    pub default_confidence: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            partial_threshold: 0.7,
            activation_threshold: 0.7,
            default_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Order in which backends are attempted
    #[serde(default = "default_backend_order")]
    pub order: Vec<BackendKind>,

    #[serde(default = "default_accelerated")]
    pub accelerated: LocalBackendConfig,

    #[serde(default = "default_cpu")]
    pub cpu: LocalBackendConfig,

    #[serde(default)]
    pub remote: RemoteBackendConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            order: default_backend_order(),
            accelerated: default_accelerated(),
            cpu: default_cpu(),
            remote: RemoteBackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the inference binary; searched for when unset
    #[serde(default)]
    pub binary_path: Option<String>,

    /// Model name reported in results
    #[serde(default = "default_local_model")]
    pub model: String,

    /// Device argument passed to the inference binary
    #[serde(default)]
    pub device: String,

    /// Memory the model needs, in MiB: video memory for the accelerated
    /// backend, free system memory for the CPU one. Unset uses the
    /// per-device default; 0 turns the check off.
    #[serde(default)]
    pub min_memory_mb: Option<u64>,

    /// Command that reports GPU memory; `nvidia-smi` when unset
    #[serde(default)]
    pub gpu_query_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBackendConfig {
    /// Remote recognition is opt-in
    #[serde(default)]
    pub enabled: bool,

    /// Chat-completions style endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_remote_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Inline API key; the environment variable wins when both are set
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            model: default_remote_model(),
            api_key_env: default_api_key_env(),
            api_key: None,
        }
    }
}

impl RemoteBackendConfig {
    /// API key from the environment, falling back to the config file
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }
}

/// How requests to send screen content off the device are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPolicy {
    /// Never use remote backends
    Never,
    /// Ask each session
    Ask,
    /// Permanently granted
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_consent")]
    pub remote_consent: ConsentPolicy,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            remote_consent: ConsentPolicy::Ask,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_attempt_timeout() -> u64 {
    15_000
}

fn default_progress_threshold() -> u64 {
    5_000
}

fn default_ttl() -> u64 {
    300
}

fn default_max_entries() -> usize {
    1000
}

fn default_threshold() -> f32 {
    0.7
}

fn default_confidence() -> f32 {
    0.5
}

fn default_backend_order() -> Vec<BackendKind> {
    vec![
        BackendKind::AcceleratedLocal,
        BackendKind::CpuLocal,
        BackendKind::RemoteApi,
    ]
}

fn default_local_model() -> String {
    "ui-detector".to_string()
}

fn default_accelerated() -> LocalBackendConfig {
    LocalBackendConfig {
        enabled: true,
        binary_path: None,
        model: "ui-tars-7b".to_string(),
        device: "cuda".to_string(),
        min_memory_mb: None,
        gpu_query_command: None,
    }
}

fn default_cpu() -> LocalBackendConfig {
    LocalBackendConfig {
        enabled: true,
        binary_path: None,
        model: "minicpm-v-2.6".to_string(),
        device: "cpu".to_string(),
        min_memory_mb: None,
        gpu_query_command: None,
    }
}

fn default_endpoint() -> String {
    "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string()
}

fn default_remote_model() -> String {
    "doubao-vision-pro".to_string()
}

fn default_api_key_env() -> String {
    "VISION_NAVIGATOR_API_KEY".to_string()
}

fn default_consent() -> ConsentPolicy {
    ConsentPolicy::Ask
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vision-navigator")
            .join("config.toml")
    }

    /// Save configuration to the default path
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to_path(Self::default_config_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
