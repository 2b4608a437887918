use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TResult, TrackerError};
use crate::speed::DEFAULT_OVERSPEED_COOLDOWN_SECS;

/// Tracker settings, loaded from an optional JSON file.
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: f64,
    pub ledger_path: PathBuf,
    /// Used when the event configuration carries no limit
    pub default_speed_limit_kmh: f64,
    /// Local override, wins over the event configuration
    pub speed_limit_override_kmh: Option<f64>,
    pub overspeed_cooldown_secs: f64,
    /// Periodic drain while online; None disables it
    pub drain_interval_secs: Option<f64>,
    /// Live status JSON file, rewritten every `status_interval_secs`
    pub status_path: Option<PathBuf>,
    pub status_interval_secs: f64,
    pub dashboard_port: Option<u16>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            api_base_url: "http://localhost:8000/api".to_string(),
            api_token: None,
            request_timeout_secs: 10.0,
            ledger_path: PathBuf::from("trail_tracker.db"),
            default_speed_limit_kmh: 60.0,
            speed_limit_override_kmh: None,
            overspeed_cooldown_secs: DEFAULT_OVERSPEED_COOLDOWN_SECS,
            drain_interval_secs: None,
            status_path: None,
            status_interval_secs: 1.0,
            dashboard_port: None,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: impl AsRef<Path>) -> TResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: TrackerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TResult<()> {
        fn positive(name: &str, value: f64) -> TResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(TrackerError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )))
            }
        }

        positive("request_timeout_secs", self.request_timeout_secs)?;
        positive("default_speed_limit_kmh", self.default_speed_limit_kmh)?;
        positive("status_interval_secs", self.status_interval_secs)?;
        if !(self.overspeed_cooldown_secs.is_finite() && self.overspeed_cooldown_secs >= 0.0) {
            return Err(TrackerError::InvalidConfig(format!(
                "overspeed_cooldown_secs must be non-negative, got {}",
                self.overspeed_cooldown_secs
            )));
        }
        if let Some(limit) = self.speed_limit_override_kmh {
            positive("speed_limit_override_kmh", limit)?;
        }
        if let Some(interval) = self.drain_interval_secs {
            positive("drain_interval_secs", interval)?;
        }
        if self.api_base_url.trim().is_empty() {
            return Err(TrackerError::InvalidConfig("api_base_url is empty".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn drain_interval(&self) -> Option<Duration> {
        self.drain_interval_secs.map(Duration::from_secs_f64)
    }

    /// Local override, then the event's limit, then the default
    pub fn effective_speed_limit(&self, event_limit_kmh: Option<f64>) -> f64 {
        self.speed_limit_override_kmh
            .or(event_limit_kmh)
            .unwrap_or(self.default_speed_limit_kmh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"api_base_url": "https://rally.example/api", "drain_interval_secs": 30}}"#)
            .unwrap();

        let config = TrackerConfig::load(file.path()).unwrap();
        assert_eq!(config.api_base_url, "https://rally.example/api");
        assert_eq!(config.drain_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.default_speed_limit_kmh, 60.0);
        assert_eq!(config.overspeed_cooldown_secs, 1.5);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = TrackerConfig {
            request_timeout_secs: 0.0,
            ..TrackerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrackerError::InvalidConfig(_))));

        let config = TrackerConfig {
            speed_limit_override_kmh: Some(-10.0),
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_speed_limit_precedence() {
        let mut config = TrackerConfig::default();
        assert_eq!(config.effective_speed_limit(None), 60.0);
        assert_eq!(config.effective_speed_limit(Some(80.0)), 80.0);
        config.speed_limit_override_kmh = Some(40.0);
        assert_eq!(config.effective_speed_limit(Some(80.0)), 40.0);
    }
}
