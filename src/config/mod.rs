//! Configuration loading and validation.
//!
//! Options live in a TOML file and may be overridden one by one through
//! environment variables using the upstream option names (`FEED_URL`,
//! `BATCH_SIZE`, ...). Validation distinguishes hard errors, which refuse
//! start, from warnings, which are logged and tolerated.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::Platform;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid option {option}: {message}")]
    Invalid { option: &'static str, message: String },
    #[error("missing required option {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub feed: FeedSettings,
    #[serde(default)]
    pub processor: ProcessorSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub platform: PlatformSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedSettings {
    /// Upstream event feed endpoint. Required.
    pub url: String,
    #[serde(default = "defaults::reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "defaults::max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "defaults::heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorSettings {
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "defaults::dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// How long `submit` may wait for a queue slot before reporting
    /// backpressure.
    #[serde(default = "defaults::submit_deadline_ms")]
    pub submit_deadline_ms: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            flush_interval_ms: defaults::flush_interval_ms(),
            dedup_window_ms: defaults::dedup_window_ms(),
            submit_deadline_ms: defaults::submit_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerSettings {
    #[serde(default = "defaults::max_tokens_tracked")]
    pub max_tokens_tracked: usize,
    #[serde(default = "defaults::grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "defaults::inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
    #[serde(default = "defaults::min_volume_24h")]
    pub min_volume_24h: f64,
    #[serde(default = "defaults::consecutive_zero_volume_periods")]
    pub consecutive_zero_volume_periods: u32,
    #[serde(default = "defaults::rug_price_drop")]
    pub rug_price_drop: f64,
    #[serde(default = "defaults::rug_volume_drop")]
    pub rug_volume_drop: f64,
    #[serde(default = "defaults::liq_threshold")]
    pub liq_threshold: f64,
    #[serde(default = "defaults::cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "defaults::max_cleanup_percentage")]
    pub max_cleanup_percentage: f64,
    #[serde(default = "defaults::min_tokens_to_keep")]
    pub min_tokens_to_keep: usize,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "defaults::cleanup_enabled")]
    pub cleanup_enabled: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_tokens_tracked: defaults::max_tokens_tracked(),
            grace_period_ms: defaults::grace_period_ms(),
            inactivity_threshold_ms: defaults::inactivity_threshold_ms(),
            min_volume_24h: defaults::min_volume_24h(),
            consecutive_zero_volume_periods: defaults::consecutive_zero_volume_periods(),
            rug_price_drop: defaults::rug_price_drop(),
            rug_volume_drop: defaults::rug_volume_drop(),
            liq_threshold: defaults::liq_threshold(),
            cleanup_interval_ms: defaults::cleanup_interval_ms(),
            max_cleanup_percentage: defaults::max_cleanup_percentage(),
            min_tokens_to_keep: defaults::min_tokens_to_keep(),
            whitelist: Vec::new(),
            cleanup_enabled: defaults::cleanup_enabled(),
        }
    }
}

impl TrackerSettings {
    /// Threshold validation run both at config load and at tracker
    /// construction. Hard errors refuse start; warnings are tolerated.
    pub fn validate(&self, analysis_interval_ms: u64) -> Result<Vec<String>, ConfigError> {
        require_positive("GRACE_PERIOD_MS", self.grace_period_ms as f64)?;
        require_positive("INACTIVITY_THRESHOLD_MS", self.inactivity_threshold_ms as f64)?;
        require_positive("MIN_VOLUME_24H", self.min_volume_24h)?;
        require_positive("LIQ_THRESHOLD", self.liq_threshold)?;
        require_positive("CLEANUP_INTERVAL_MS", self.cleanup_interval_ms as f64)?;
        require_unit_range("MAX_CLEANUP_PERCENTAGE", self.max_cleanup_percentage)?;
        require_unit_range("RUG_PRICE_DROP", self.rug_price_drop)?;
        require_unit_range("RUG_VOLUME_DROP", self.rug_volume_drop)?;

        let mut warnings = Vec::new();
        if self.inactivity_threshold_ms < 60_000 {
            warnings.push("inactivity threshold below 1 minute".to_string());
        }
        if self.cleanup_interval_ms < 60_000 {
            warnings.push("cleanup interval below 1 minute".to_string());
        }
        if self.max_cleanup_percentage > 0.5 {
            warnings.push(format!(
                "max cleanup percentage {:.2} removes more than half the population per cycle",
                self.max_cleanup_percentage
            ));
        }
        if self.grace_period_ms < 300_000 {
            warnings.push("grace period below 5 minutes".to_string());
        }
        if self.cleanup_interval_ms < analysis_interval_ms {
            warnings.push("cleanup interval shorter than analysis interval".to_string());
        }
        if self.inactivity_threshold_ms < self.grace_period_ms {
            warnings.push(
                "inactivity threshold shorter than grace period; tokens would never be considered inactive"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisSettings {
    #[serde(default = "defaults::analysis_interval_ms")]
    pub analysis_interval_ms: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            analysis_interval_ms: defaults::analysis_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformSettings {
    /// Platform assigned to snapshots the detector cannot resolve. When unset,
    /// unresolvable token events are rejected and counted.
    #[serde(default)]
    pub fallback_platform: Option<Platform>,
    /// Optional authoritative program-directory endpoint.
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default = "defaults::detection_cache_ttl_secs")]
    pub detection_cache_ttl_secs: u64,
    #[serde(default = "defaults::detection_cache_max_entries")]
    pub detection_cache_max_entries: usize,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            fallback_platform: None,
            directory_url: None,
            detection_cache_ttl_secs: defaults::detection_cache_ttl_secs(),
            detection_cache_max_entries: defaults::detection_cache_max_entries(),
        }
    }
}

mod defaults {
    pub fn reconnect_delay_ms() -> u64 {
        5_000
    }
    pub fn max_reconnect_attempts() -> u32 {
        10
    }
    pub fn heartbeat_ms() -> u64 {
        30_000
    }
    pub fn connect_timeout_ms() -> u64 {
        30_000
    }
    pub fn batch_size() -> usize {
        100
    }
    pub fn flush_interval_ms() -> u64 {
        5_000
    }
    pub fn dedup_window_ms() -> u64 {
        1_000
    }
    pub fn submit_deadline_ms() -> u64 {
        250
    }
    pub fn max_tokens_tracked() -> usize {
        1_000
    }
    pub fn grace_period_ms() -> u64 {
        1_800_000
    }
    pub fn inactivity_threshold_ms() -> u64 {
        3_600_000
    }
    pub fn min_volume_24h() -> f64 {
        10.0
    }
    pub fn consecutive_zero_volume_periods() -> u32 {
        3
    }
    pub fn rug_price_drop() -> f64 {
        0.95
    }
    pub fn rug_volume_drop() -> f64 {
        0.99
    }
    pub fn liq_threshold() -> f64 {
        100.0
    }
    pub fn cleanup_interval_ms() -> u64 {
        300_000
    }
    pub fn max_cleanup_percentage() -> f64 {
        0.10
    }
    pub fn min_tokens_to_keep() -> usize {
        100
    }
    pub fn cleanup_enabled() -> bool {
        true
    }
    pub fn analysis_interval_ms() -> u64 {
        60_000
    }
    pub fn detection_cache_ttl_secs() -> u64 {
        86_400
    }
    pub fn detection_cache_max_entries() -> usize {
        10_000
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build a config purely from environment variables. `FEED_URL` is the
    /// only required option.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("FEED_URL").map_err(|_| ConfigError::Missing("FEED_URL"))?;
        let mut config = Config {
            feed: FeedSettings {
                url,
                reconnect_delay_ms: defaults::reconnect_delay_ms(),
                max_reconnect_attempts: defaults::max_reconnect_attempts(),
                heartbeat_ms: defaults::heartbeat_ms(),
                connect_timeout_ms: defaults::connect_timeout_ms(),
            },
            processor: ProcessorSettings::default(),
            tracker: TrackerSettings::default(),
            analysis: AnalysisSettings::default(),
            platform: PlatformSettings::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        override_from_env("FEED_URL", &mut self.feed.url);
        override_parsed("RECONNECT_DELAY_MS", &mut self.feed.reconnect_delay_ms);
        override_parsed("MAX_RECONNECT_ATTEMPTS", &mut self.feed.max_reconnect_attempts);
        override_parsed("HEARTBEAT_MS", &mut self.feed.heartbeat_ms);
        override_parsed("FEED_CONNECT_TIMEOUT_MS", &mut self.feed.connect_timeout_ms);
        override_parsed("BATCH_SIZE", &mut self.processor.batch_size);
        override_parsed("FLUSH_INTERVAL_MS", &mut self.processor.flush_interval_ms);
        override_parsed("DEDUP_WINDOW_MS", &mut self.processor.dedup_window_ms);
        override_parsed("MAX_TOKENS_TRACKED", &mut self.tracker.max_tokens_tracked);
        override_parsed("GRACE_PERIOD_MS", &mut self.tracker.grace_period_ms);
        override_parsed("INACTIVITY_THRESHOLD_MS", &mut self.tracker.inactivity_threshold_ms);
        override_parsed("MIN_VOLUME_24H", &mut self.tracker.min_volume_24h);
        override_parsed(
            "CONSECUTIVE_ZERO_VOLUME_PERIODS",
            &mut self.tracker.consecutive_zero_volume_periods,
        );
        override_parsed("RUG_PRICE_DROP", &mut self.tracker.rug_price_drop);
        override_parsed("RUG_VOLUME_DROP", &mut self.tracker.rug_volume_drop);
        override_parsed("LIQ_THRESHOLD", &mut self.tracker.liq_threshold);
        override_parsed("CLEANUP_INTERVAL_MS", &mut self.tracker.cleanup_interval_ms);
        override_parsed("MAX_CLEANUP_PERCENTAGE", &mut self.tracker.max_cleanup_percentage);
        override_parsed("MIN_TOKENS_TO_KEEP", &mut self.tracker.min_tokens_to_keep);
        override_parsed("CLEANUP_ENABLED", &mut self.tracker.cleanup_enabled);
        override_parsed("ANALYSIS_INTERVAL_MS", &mut self.analysis.analysis_interval_ms);

        if let Ok(raw) = std::env::var("WHITELIST") {
            self.tracker.whitelist = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(raw) = std::env::var("FALLBACK_PLATFORM") {
            if let Ok(platform) = Platform::from_str(&raw) {
                self.platform.fallback_platform = Some(platform);
            }
        }
    }

    /// Validate the configuration. Returns warnings for tolerable but
    /// suspicious settings; hard errors refuse start.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.feed.url.is_empty() {
            return Err(ConfigError::Missing("FEED_URL"));
        }
        url::Url::parse(&self.feed.url).map_err(|e| ConfigError::Invalid {
            option: "FEED_URL",
            message: e.to_string(),
        })?;

        require_positive("BATCH_SIZE", self.processor.batch_size as f64)?;
        require_positive("FLUSH_INTERVAL_MS", self.processor.flush_interval_ms as f64)?;
        require_positive("DEDUP_WINDOW_MS", self.processor.dedup_window_ms as f64)?;
        require_positive("ANALYSIS_INTERVAL_MS", self.analysis.analysis_interval_ms as f64)?;

        if let Some(platform) = self.platform.fallback_platform {
            if !platform.is_known() {
                return Err(ConfigError::Invalid {
                    option: "FALLBACK_PLATFORM",
                    message: "fallback platform must be a concrete platform".to_string(),
                });
            }
        }

        self.tracker.validate(self.analysis.analysis_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.processor.flush_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.processor.dedup_window_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.tracker.cleanup_interval_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis.analysis_interval_ms)
    }
}

fn override_from_env(name: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn override_parsed<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse::<T>() {
            *slot = value;
        }
    }
}

fn require_positive(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if value <= 0.0 {
        return Err(ConfigError::Invalid {
            option,
            message: format!("must be positive, got {}", value),
        });
    }
    Ok(())
}

fn require_unit_range(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if value <= 0.0 || value > 1.0 {
        return Err(ConfigError::Invalid {
            option,
            message: format!("must be in (0, 1], got {}", value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> Config {
        Config {
            feed: FeedSettings {
                url: "wss://feed.example/api/data".to_string(),
                reconnect_delay_ms: defaults::reconnect_delay_ms(),
                max_reconnect_attempts: defaults::max_reconnect_attempts(),
                heartbeat_ms: defaults::heartbeat_ms(),
                connect_timeout_ms: defaults::connect_timeout_ms(),
            },
            processor: ProcessorSettings::default(),
            tracker: TrackerSettings::default(),
            analysis: AnalysisSettings::default(),
            platform: PlatformSettings::default(),
        }
    }

    #[test]
    fn default_config_validates_clean() {
        let warnings = base_config().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        let mut config = base_config();
        config.tracker.max_cleanup_percentage = 0.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.tracker.rug_price_drop = 1.5;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.tracker.rug_volume_drop = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_thresholds() {
        let mut config = base_config();
        config.tracker.liq_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.tracker.min_volume_24h = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn warns_on_suspicious_but_legal_settings() {
        let mut config = base_config();
        config.tracker.max_cleanup_percentage = 0.5;
        config.tracker.grace_period_ms = 60_000;
        config.tracker.inactivity_threshold_ms = 30_000;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("grace period below 5 minutes")));
        assert!(warnings.iter().any(|w| w.contains("never be considered inactive")));
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[feed]
url = "wss://feed.example/api/data"

[tracker]
min_tokens_to_keep = 5
whitelist = ["So11111111111111111111111111111111111111112"]

[platform]
fallback_platform = "pump"
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.tracker.min_tokens_to_keep, 5);
        assert_eq!(config.tracker.whitelist.len(), 1);
        assert_eq!(config.platform.fallback_platform, Some(Platform::Pump));
        assert_eq!(config.processor.batch_size, 100);
    }
}
