//! Agent configuration.
//!
//! Everything here is read once at startup and handed to the components as
//! owned copies. Durations are stored as milliseconds so the JSON form stays
//! flat and easy to edit on the device.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for the powermeter agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Wireless network identity
    pub wifi: WifiConfig,
    /// Pushgateway endpoint and payload options
    pub push: PushConfig,
    /// Pulse detection tuning
    pub detector: DetectorConfig,
    /// When reports are due
    pub scheduler: SchedulerConfig,
    /// Delivery retry behaviour
    pub retry: RetryConfig,
    /// Where the meter state is kept
    pub storage: StorageConfig,
    /// Meter constant
    pub energy: EnergyConfig,
    /// Log every state transition and delivery attempt
    pub debug: bool,
}

/// Wireless network identity and link supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Network name
    pub ssid: String,
    /// Network passphrase
    pub passphrase: String,
    /// Interface the link manager supervises
    pub interface: String,
    /// Upper bound for a single association attempt
    pub association_timeout_ms: u64,
    /// How often an established link is re-checked
    pub link_check_interval_ms: u64,
    /// First wait after a failed association
    pub initial_backoff_ms: u64,
    /// Cap for the association backoff
    pub max_backoff_ms: u64,
}

/// Pushgateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Aggregator host name
    pub host: String,
    /// Aggregator TCP port
    pub port: u16,
    /// Grouping path, e.g. `/metrics/job/powermeter/instance/home`
    pub context: String,
    /// Name of the pushed gauge
    pub metric_name: String,
    /// Deadline for one HTTP request, connect included
    pub request_timeout_ms: u64,
}

/// Light sensor sampling and pulse detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// BCM pin number of the sensor comparator output
    pub pin: u8,
    /// Enable the internal pull-up on the sensor pin
    pub pull_up: bool,
    /// Whether a blink raises or lowers the reading
    pub polarity: Polarity,
    /// Level the signal must exceed to enter the active state
    pub high_threshold: u16,
    /// Level the signal must drop below to return to idle
    pub low_threshold: u16,
    /// Minimum time between two accepted transitions
    pub debounce_ms: u64,
    /// Stuck-signal duration that raises a diagnostic
    pub stall_ms: u64,
    /// Sampling period
    pub sample_interval_ms: u64,
}

/// Signal polarity of the sensor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// A blink raises the reading
    #[default]
    ActiveHigh,
    /// A blink lowers the reading
    ActiveLow,
}

/// Report triggering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Report after this many blinks
    pub threshold: u64,
    /// Force a report after this long even below threshold (disabled when unset)
    pub max_interval_secs: Option<u64>,
}

/// Delivery retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per job before deferring
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    pub initial_backoff_ms: u64,
    /// Cap for the wait between attempts
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

/// Persistent storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the meter state slots
    pub data_dir: PathBuf,
}

/// Meter constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Blinks per kilowatt-hour, printed on the meter face
    pub impulses_per_kwh: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            wifi: WifiConfig::default(),
            push: PushConfig::default(),
            detector: DetectorConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            energy: EnergyConfig::default(),
            debug: true,
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: "your_wireless_network".to_string(),
            passphrase: "wireless_network_password".to_string(),
            interface: "wlan0".to_string(),
            association_timeout_ms: 15_000,
            link_check_interval_ms: 5_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            host: "pushgateway.prometheus.localhost".to_string(),
            port: crate::DEFAULT_PUSH_PORT,
            context: "/metrics/job/powermeter/instance/home".to_string(),
            metric_name: "powermeter_energy_wh".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pin: 17,
            pull_up: false,
            polarity: Polarity::ActiveHigh,
            high_threshold: 600,
            low_threshold: 400,
            debounce_ms: 50,
            stall_ms: 3_600_000,
            sample_interval_ms: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_THRESHOLD,
            max_interval_secs: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/powermeter"),
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            impulses_per_kwh: 1000,
        }
    }
}

impl AgentConfig {
    /// Read a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AgentError::config_error(format!("Invalid config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Set the aggregator host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.push.host = host.into();
        self
    }

    /// Set the aggregator port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.push.port = port;
        self
    }

    /// Set the grouping path.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.push.context = context.into();
        self
    }

    /// Set the report threshold.
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.scheduler.threshold = threshold;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = dir.into();
        self
    }

    /// Enable or disable debug logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.threshold == 0 {
            return Err(AgentError::config_error("threshold must be at least 1"));
        }
        if self.push.host.trim().is_empty() {
            return Err(AgentError::config_error("push host must not be empty"));
        }
        if !self.push.context.starts_with('/') {
            return Err(AgentError::config_error(format!(
                "push context must start with '/': {}",
                self.push.context
            )));
        }
        if self.push.request_timeout_ms == 0 {
            return Err(AgentError::config_error("request timeout must be non-zero"));
        }
        if self.detector.low_threshold >= self.detector.high_threshold {
            return Err(AgentError::config_error(format!(
                "low threshold {} must be below high threshold {}",
                self.detector.low_threshold, self.detector.high_threshold
            )));
        }
        if self.detector.debounce_ms == 0 || self.detector.sample_interval_ms == 0 {
            return Err(AgentError::config_error(
                "debounce and sample interval must be non-zero",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AgentError::config_error("retry max_attempts must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(AgentError::config_error("retry multiplier must be >= 1.0"));
        }
        if self.energy.impulses_per_kwh == 0 {
            return Err(AgentError::config_error("impulses_per_kwh must be non-zero"));
        }
        self.push.grouping_labels()?;
        Ok(())
    }
}

impl PushConfig {
    /// Full push URL, e.g. `http://host:2491/metrics/job/powermeter/instance/home`.
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.context)
    }

    /// Label pairs encoded in the grouping path.
    ///
    /// `/metrics/job/powermeter/instance/home` yields
    /// `[("job", "powermeter"), ("instance", "home")]`.
    pub fn grouping_labels(&self) -> Result<Vec<(String, String)>> {
        let segments: Vec<&str> = self
            .context
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let rest = match segments.as_slice() {
            ["metrics", "job", rest @ ..] if !rest.is_empty() => rest,
            _ => {
                return Err(AgentError::config_error(format!(
                    "push context must look like /metrics/job/<name>[/<label>/<value>...]: {}",
                    self.context
                )))
            }
        };

        let mut labels = vec![("job".to_string(), rest[0].to_string())];
        let pairs = &rest[1..];
        if pairs.len() % 2 != 0 {
            return Err(AgentError::config_error(format!(
                "grouping label without value in {}",
                self.context
            )));
        }
        for pair in pairs.chunks(2) {
            labels.push((pair[0].to_string(), pair[1].to_string()));
        }
        Ok(labels)
    }

    /// Deadline for one HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl WifiConfig {
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    pub fn link_check_interval(&self) -> Duration {
        Duration::from_millis(self.link_check_interval_ms)
    }
}

impl DetectorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl SchedulerConfig {
    /// Time-based fallback, if configured.
    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_secs.map(Duration::from_secs)
    }
}

impl EnergyConfig {
    /// Watt-hours represented by one blink.
    pub fn wh_per_pulse(&self) -> f64 {
        1000.0 / f64::from(self.impulses_per_kwh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.threshold, 25);
        assert!(config.debug);
    }

    #[test]
    fn test_default_push_url() {
        let config = AgentConfig::default();
        assert_eq!(
            config.push.url(),
            "http://pushgateway.prometheus.localhost:2491/metrics/job/powermeter/instance/home"
        );
    }

    #[test]
    fn test_grouping_labels() {
        let push = PushConfig::default();
        let labels = push.grouping_labels().unwrap();
        assert_eq!(
            labels,
            vec![
                ("job".to_string(), "powermeter".to_string()),
                ("instance".to_string(), "home".to_string()),
            ]
        );
    }

    #[test]
    fn test_grouping_labels_rejects_dangling_label() {
        let push = PushConfig {
            context: "/metrics/job/powermeter/instance".to_string(),
            ..Default::default()
        };
        assert!(push.grouping_labels().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = AgentConfig::default();
        config.detector.low_threshold = 700;
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = AgentConfig::default().with_threshold(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"scheduler": {"threshold": 10}, "debug": true}"#).unwrap();
        assert_eq!(config.scheduler.threshold, 10);
        assert!(config.debug);
        assert_eq!(config.push.port, 2491);
        assert_eq!(config.detector.polarity, Polarity::ActiveHigh);
    }

    #[test]
    fn test_wh_per_pulse() {
        let energy = EnergyConfig { impulses_per_kwh: 800 };
        assert!((energy.wh_per_pulse() - 1.25).abs() < f64::EPSILON);
    }
}
