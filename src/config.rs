//! Configuration loading from file and environment variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Notification title used by the fan-out when none is configured.
pub const DEFAULT_NOTIFICATION_TITLE: &str = "Hazard detected in your area";

/// Notification body used by the fan-out when none is configured.
pub const DEFAULT_NOTIFICATION_BODY: &str = "A road hazard was reported near your location. Drive safe!";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HazardConfig {
    /// Live matcher sessions.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Server-side fan-out.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for `LiveMatcher` sessions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Alerting radius used when `start` is not given one.
    pub radius_km: f64,
    /// Resubscribe attempts after the feed drops a subscription.
    pub resubscribe_attempts: u32,
    /// Base backoff between resubscribe attempts; attempt `n` waits `n` times this.
    pub resubscribe_backoff_ms: u64,
    /// Event ids remembered per session for duplicate suppression.
    pub dedupe_capacity: usize,
    /// Capacity of streams made by `LiveMatcher::alert_channel`.
    pub alert_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            resubscribe_attempts: 3,
            resubscribe_backoff_ms: 250,
            dedupe_capacity: 4096,
            alert_buffer: 256,
        }
    }
}

impl WatchConfig {
    /// `resubscribe_backoff_ms` as a `Duration`.
    #[must_use]
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

/// Settings for `FanoutDispatcher` and `FanoutService`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Subscribers farther than this from the hazard are not notified.
    pub radius_km: f64,
    /// Maximum recipients per transport call.
    pub batch_size: usize,
    /// Retries after the first failed attempt of a batch.
    pub retry_count: u32,
    /// Base backoff between batch retries; retry `n` waits `n` times this.
    pub retry_backoff_ms: u64,
    /// Upper bound on a single `NotificationSender::send` call.
    pub send_timeout_ms: u64,
    /// Concurrent dispatch workers in the service.
    pub workers: usize,
    /// Queued events awaiting a worker.
    pub queue_capacity: usize,
    /// Event ids remembered by the service for duplicate suppression.
    pub dedupe_capacity: usize,
    /// Buffered failure reports before overflow is counted and dropped.
    pub failure_buffer: usize,
    /// Resubscribe attempts after the feed drops the service's subscription.
    pub resubscribe_attempts: u32,
    /// Base backoff between resubscribe attempts.
    pub resubscribe_backoff_ms: u64,
    /// Push notification title.
    pub notification_title: String,
    /// Push notification body.
    pub notification_body: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            batch_size: 500,
            retry_count: 2,
            retry_backoff_ms: 200,
            send_timeout_ms: 10_000,
            workers: 4,
            queue_capacity: 1024,
            dedupe_capacity: 4096,
            failure_buffer: 1024,
            resubscribe_attempts: 5,
            resubscribe_backoff_ms: 500,
            notification_title: DEFAULT_NOTIFICATION_TITLE.to_string(),
            notification_body: DEFAULT_NOTIFICATION_BODY.to_string(),
        }
    }
}

impl FanoutConfig {
    /// `retry_backoff_ms` as a `Duration`.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// `send_timeout_ms` as a `Duration`.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// `resubscribe_backoff_ms` as a `Duration`.
    #[must_use]
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "hazardwatch=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is not usable.
    #[error("invalid config value for {key}: {reason}")]
    Invalid {
        /// Offending TOML key or environment variable.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Where `load_config_with_source` found its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// No path was given; built-in defaults.
    Defaults,
    /// Read from this file.
    File(String),
    /// A path was given but nothing exists there; built-in defaults.
    Missing(String),
}

impl HazardConfig {
    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` or `ConfigError::Invalid`.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_radius("watch.radius_km", self.watch.radius_km)?;
        check_radius("fanout.radius_km", self.fanout.radius_km)?;
        if self.fanout.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "fanout.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.fanout.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "fanout.send_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fanout.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "fanout.workers",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_radius(key: &'static str, value: f64) -> Result<(), ConfigError> {
    crate::geo::validate_radius(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `HAZARD_RADIUS_KM` overrides both `watch.radius_km` and `fanout.radius_km`
/// - `HAZARD_BATCH_SIZE` overrides `fanout.batch_size`
/// - `HAZARD_RETRY_COUNT` overrides `fanout.retry_count`
/// - `HAZARD_RETRY_BACKOFF_MS` overrides `fanout.retry_backoff_ms`
/// - `HAZARD_LOG_LEVEL` overrides `logging.level`
/// - `HAZARD_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<HazardConfig, ConfigError> {
    let (config, source) = load_config_with_source(path)?;
    if let ConfigSource::Missing(p) = &source {
        tracing::info!(path = %p, "config file not found, using defaults");
    }
    Ok(config)
}

/// Like `load_config`, but returns where the settings came from instead of
/// logging it, for callers that configure logging from the result.
///
/// # Errors
///
/// Same as `load_config`.
pub fn load_config_with_source(path: Option<&str>) -> Result<(HazardConfig, ConfigSource), ConfigError> {
    let (mut config, source) = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => (toml::from_str(&contents)?, ConfigSource::File(p.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (HazardConfig::default(), ConfigSource::Missing(p.to_string()))
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => (HazardConfig::default(), ConfigSource::Defaults),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok((config, source))
}

fn apply_env_overrides(
    config: &mut HazardConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = var("HAZARD_RADIUS_KM") {
        let radius = parse_env("HAZARD_RADIUS_KM", &v)?;
        config.watch.radius_km = radius;
        config.fanout.radius_km = radius;
    }
    if let Some(v) = var("HAZARD_BATCH_SIZE") {
        config.fanout.batch_size = parse_env("HAZARD_BATCH_SIZE", &v)?;
    }
    if let Some(v) = var("HAZARD_RETRY_COUNT") {
        config.fanout.retry_count = parse_env("HAZARD_RETRY_COUNT", &v)?;
    }
    if let Some(v) = var("HAZARD_RETRY_BACKOFF_MS") {
        config.fanout.retry_backoff_ms = parse_env("HAZARD_RETRY_BACKOFF_MS", &v)?;
    }
    if let Some(v) = var("HAZARD_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = var("HAZARD_LOG_JSON") {
        config.logging.json = v.eq_ignore_ascii_case("true") || v == "1";
    }
    Ok(())
}

fn parse_env<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HazardConfig::default();
        assert_eq!(cfg.watch.radius_km, 5.0);
        assert_eq!(cfg.fanout.radius_km, 5.0);
        assert_eq!(cfg.fanout.batch_size, 500);
        assert_eq!(cfg.fanout.retry_count, 2);
        assert_eq!(cfg.fanout.notification_title, DEFAULT_NOTIFICATION_TITLE);
        assert_eq!(cfg.logging.level, "info");
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = HazardConfig::from_toml_str(
            r#"
            [fanout]
            batch_size = 100
            retry_backoff_ms = 10

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fanout.batch_size, 100);
        assert_eq!(cfg.fanout.retry_backoff(), Duration::from_millis(10));
        assert_eq!(cfg.fanout.retry_count, 2);
        assert_eq!(cfg.watch, WatchConfig::default());
        assert!(cfg.logging.json);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = HazardConfig::from_toml_str("[fanout]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "fanout.batch_size", .. }));

        let err = HazardConfig::from_toml_str("[watch]\nradius_km = -2.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "watch.radius_km", .. }));

        let err = HazardConfig::from_toml_str("[watch]\nradius_km = \"far\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("HAZARD_RADIUS_KM", "2.5"),
            ("HAZARD_BATCH_SIZE", "50"),
            ("HAZARD_LOG_JSON", "TRUE"),
        ]
        .into_iter()
        .collect();

        let mut cfg = HazardConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.watch.radius_km, 2.5);
        assert_eq!(cfg.fanout.radius_km, 2.5);
        assert_eq!(cfg.fanout.batch_size, 50);
        assert!(cfg.logging.json);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut cfg = HazardConfig::default();
        let err = apply_env_overrides(&mut cfg, |k| (k == "HAZARD_RETRY_COUNT").then(|| "many".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HAZARD_RETRY_COUNT", .. }));
    }

    #[test]
    fn load_config_reads_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hazard.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[fanout]\nretry_count = 4").unwrap();

        let cfg = load_config(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.fanout.retry_count, 4);

        let missing = dir.path().join("absent.toml");
        let cfg = load_config(Some(missing.to_str().unwrap())).unwrap();
        assert_eq!(cfg.fanout.retry_count, HazardConfig::default().fanout.retry_count);
    }

    #[test]
    fn load_config_with_source_reports_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hazard.toml");
        std::fs::write(&path, "[watch]\nalert_buffer = 8\n").unwrap();
        let path = path.to_str().unwrap();

        let (cfg, source) = load_config_with_source(Some(path)).unwrap();
        assert_eq!(cfg.watch.alert_buffer, 8);
        assert_eq!(source, ConfigSource::File(path.to_string()));

        let missing = dir.path().join("absent.toml");
        let missing = missing.to_str().unwrap();
        let (_, source) = load_config_with_source(Some(missing)).unwrap();
        assert_eq!(source, ConfigSource::Missing(missing.to_string()));

        let (_, source) = load_config_with_source(None).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
    }
}
