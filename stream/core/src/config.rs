//! TOML Configuration File Support
//!
//! Centralized configuration for mentor-stream, loaded from
//! `~/.config/mentor-stream/config.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`MENTOR_STREAM_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! base_url = "https://mentor.example.com/api"
//! connect_timeout_ms = 5000
//! read_timeout_ms = 60000
//!
//! [pacing]
//! policy = "paced"
//! fast_delay_ms = 5
//! slow_delay_ms = 20
//! backlog_threshold = 30
//!
//! [progress]
//! tick_interval_ms = 100
//! expected_bytes = 3000
//! smoothing = 0.2
//!
//! [registry]
//! max_concurrent_streams = 16
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pacing::PacingConfig;
use crate::policy::PayloadPolicy;
use crate::progress::ProgressConfig;
use crate::registry::{RegistryConfig, StreamRegistry};
use crate::stream::StreamOptions;
use crate::transport::TransportConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Cli,
    Env,
    File,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Base URL relative endpoints are joined to
    pub base_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    /// Capacity of the per-stream event channel
    pub channel_capacity: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingToml {
    /// Default payload policy ("paced" or "passthrough")
    pub policy: Option<PayloadPolicy>,
    pub fast_delay_ms: Option<u64>,
    pub slow_delay_ms: Option<u64>,
    pub backlog_threshold: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressToml {
    pub tick_interval_ms: Option<u64>,
    pub warmup_floor: Option<f64>,
    pub warmup_ceiling: Option<f64>,
    pub warmup_duration_ms: Option<u64>,
    pub expected_bytes: Option<u64>,
    pub volume_weight: Option<f64>,
    pub time_bonus_per_sec: Option<f64>,
    pub time_bonus_cap: Option<f64>,
    pub streaming_cap: Option<f64>,
    pub finalizing_step: Option<f64>,
    pub smoothing: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    pub max_concurrent_streams: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    pub transport: TransportToml,
    pub pacing: PacingToml,
    pub progress: ProgressToml,
    pub registry: RegistryToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration after all sources are applied
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub transport: TransportConfig,
    pub pacing: PacingConfig,
    pub progress: ProgressConfig,
    pub registry: RegistryConfig,
    /// Policy used when the caller does not choose one
    pub default_policy: PayloadPolicy,
    pub channel_capacity: usize,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            pacing: PacingConfig::default(),
            progress: ProgressConfig::default(),
            registry: RegistryConfig::default(),
            default_policy: PayloadPolicy::default(),
            channel_capacity: StreamOptions::default().channel_capacity,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Per-stream options derived from this configuration
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            pacing: self.pacing.clone(),
            channel_capacity: self.channel_capacity,
            ..StreamOptions::default()
        }
    }

    /// Registry enforcing the configured stream limits
    #[must_use]
    pub fn build_registry(&self) -> StreamRegistry {
        StreamRegistry::new(self.registry.clone())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
        let p = &self.progress;

        if self.transport.base_url.trim().is_empty() {
            return invalid("transport.base_url must not be empty".into());
        }
        if self.pacing.fast_delay > self.pacing.slow_delay {
            return invalid(format!(
                "pacing.fast_delay_ms ({}) exceeds pacing.slow_delay_ms ({})",
                self.pacing.fast_delay.as_millis(),
                self.pacing.slow_delay.as_millis()
            ));
        }
        if p.tick_interval.is_zero() {
            return invalid("progress.tick_interval_ms must be greater than zero".into());
        }
        if !(p.smoothing > 0.0 && p.smoothing <= 1.0) {
            return invalid(format!("progress.smoothing ({}) must be in (0, 1]", p.smoothing));
        }
        if p.expected_bytes == 0 {
            return invalid("progress.expected_bytes must be greater than zero".into());
        }
        if !(0.0 <= p.warmup_floor
            && p.warmup_floor <= p.warmup_ceiling
            && p.warmup_ceiling <= p.streaming_cap
            && p.streaming_cap <= 100.0)
        {
            return invalid(
                "progress values must satisfy 0 <= warmup_floor <= warmup_ceiling <= streaming_cap <= 100"
                    .into(),
            );
        }
        if p.finalizing_step <= 0.0 {
            return invalid("progress.finalizing_step must be positive".into());
        }
        if self.registry.max_concurrent_streams == 0 {
            return invalid("registry.max_concurrent_streams must be greater than zero".into());
        }
        if self.channel_capacity == 0 {
            return invalid("transport.channel_capacity must be greater than zero".into());
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/mentor-stream/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mentor-stream").join("config.toml"))
}

/// Load configuration from the default path, the environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config() -> Result<StreamConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamConfig, ConfigError> {
    let mut config = StreamConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut StreamConfig, toml: &StreamToml) {
    // Transport
    if let Some(ref url) = toml.transport.base_url {
        config.transport.base_url = url.clone();
    }
    if let Some(ms) = toml.transport.connect_timeout_ms {
        config.transport.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.transport.read_timeout_ms {
        config.transport.read_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.transport.channel_capacity {
        config.channel_capacity = capacity;
    }

    // Pacing
    if let Some(policy) = toml.pacing.policy {
        config.default_policy = policy;
    }
    if let Some(ms) = toml.pacing.fast_delay_ms {
        config.pacing.fast_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.pacing.slow_delay_ms {
        config.pacing.slow_delay = Duration::from_millis(ms);
    }
    if let Some(threshold) = toml.pacing.backlog_threshold {
        config.pacing.backlog_threshold = threshold;
    }

    // Progress
    let p = &toml.progress;
    let progress = &mut config.progress;
    if let Some(ms) = p.tick_interval_ms {
        progress.tick_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = p.warmup_duration_ms {
        progress.warmup_duration = Duration::from_millis(ms);
    }
    if let Some(bytes) = p.expected_bytes {
        progress.expected_bytes = bytes;
    }
    for (value, slot) in [
        (p.warmup_floor, &mut progress.warmup_floor),
        (p.warmup_ceiling, &mut progress.warmup_ceiling),
        (p.volume_weight, &mut progress.volume_weight),
        (p.time_bonus_per_sec, &mut progress.time_bonus_per_sec),
        (p.time_bonus_cap, &mut progress.time_bonus_cap),
        (p.streaming_cap, &mut progress.streaming_cap),
        (p.finalizing_step, &mut progress.finalizing_step),
        (p.smoothing, &mut progress.smoothing),
    ] {
        if let Some(value) = value {
            *slot = value;
        }
    }

    // Registry
    if let Some(max) = toml.registry.max_concurrent_streams {
        config.registry.max_concurrent_streams = max;
    }
}

/// Apply `MENTOR_STREAM_*` variables read through `lookup`
fn apply_env_config<F>(config: &mut StreamConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(url) = lookup("MENTOR_STREAM_BASE_URL") {
        config.transport.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("MENTOR_STREAM_CONNECT_TIMEOUT_MS") {
        config.transport.connect_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("MENTOR_STREAM_READ_TIMEOUT_MS") {
        config.transport.read_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(policy) = lookup("MENTOR_STREAM_POLICY").and_then(|v| v.parse().ok()) {
        config.default_policy = policy;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("MENTOR_STREAM_FAST_DELAY_MS") {
        config.pacing.fast_delay = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("MENTOR_STREAM_SLOW_DELAY_MS") {
        config.pacing.slow_delay = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed("MENTOR_STREAM_BACKLOG_THRESHOLD") {
        config.pacing.backlog_threshold = n as usize;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("MENTOR_STREAM_PROGRESS_TICK_MS") {
        config.progress.tick_interval = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed("MENTOR_STREAM_MAX_STREAMS") {
        config.registry.max_concurrent_streams = n as usize;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub policy: Option<PayloadPolicy>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: PayloadPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_read_timeout_ms(mut self, ms: u64) -> Self {
        self.read_timeout_ms = Some(ms);
        self
    }

    fn is_empty(&self) -> bool {
        self.base_url.is_none()
            && self.policy.is_none()
            && self.connect_timeout_ms.is_none()
            && self.read_timeout_ms.is_none()
    }

    pub fn apply(&self, config: &mut StreamConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(ref url) = self.base_url {
            config.transport.base_url = url.clone();
        }
        if let Some(policy) = self.policy {
            config.default_policy = policy;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.transport.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.read_timeout_ms {
            config.transport.read_timeout = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
