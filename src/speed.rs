use serde::{Deserialize, Serialize};

use crate::geo::speed_kmh_between;
use crate::types::PositionSample;

/// Minimum seconds between two raised alerts while overspeed persists
pub const DEFAULT_OVERSPEED_COOLDOWN_SECS: f64 = 1.5;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedAlertState {
    pub overspeed_active: bool,
    /// Sample timestamp (unix seconds) of the last raised alert
    pub last_alert_at: Option<f64>,
    pub violation_count: u64,
}

/// Outcome of one speed check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedAlert {
    /// At or under the limit, nothing active
    Normal,
    /// Alert raised (first violation, or cooldown elapsed while still over)
    Raised,
    /// Still over the limit inside the cooldown window
    Active,
    /// Dropped back to or under the limit
    Cleared,
}

/// Source of the speed used for a check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedSource {
    Reported,
    Derived,
    Simulated,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedReading {
    pub speed_kmh: f64,
    pub source: SpeedSource,
    pub alert: SpeedAlert,
}

pub struct SpeedMonitor {
    limit_kmh: f64,
    cooldown_secs: f64,
    state: SpeedAlertState,
    current_speed_kmh: f64,
    simulated_speed_kmh: Option<f64>,
    last_fix: Option<(f64, f64, f64)>,
}

impl SpeedMonitor {
    pub fn new(limit_kmh: f64) -> Self {
        Self::with_cooldown(limit_kmh, DEFAULT_OVERSPEED_COOLDOWN_SECS)
    }

    pub fn with_cooldown(limit_kmh: f64, cooldown_secs: f64) -> Self {
        SpeedMonitor {
            limit_kmh,
            cooldown_secs,
            state: SpeedAlertState::default(),
            current_speed_kmh: 0.0,
            simulated_speed_kmh: None,
            last_fix: None,
        }
    }

    pub fn limit_kmh(&self) -> f64 {
        self.limit_kmh
    }

    /// Takes effect on the next check; alert state is kept
    pub fn set_limit(&mut self, limit_kmh: f64) {
        log::info!("Speed limit changed: {:.1} -> {:.1} km/h", self.limit_kmh, limit_kmh);
        self.limit_kmh = limit_kmh;
    }

    /// Override measured speed (movement simulator); None restores measured speed
    pub fn set_simulated_speed(&mut self, speed_kmh: Option<f64>) {
        self.simulated_speed_kmh = speed_kmh.filter(|s| s.is_finite() && *s >= 0.0);
    }

    pub fn current_speed_kmh(&self) -> f64 {
        self.current_speed_kmh
    }

    pub fn state(&self) -> &SpeedAlertState {
        &self.state
    }

    pub fn is_overspeed(&self) -> bool {
        self.state.overspeed_active
    }

    /// Check one position sample.
    ///
    /// Speed precedence: simulated, then reported, then derived from the
    /// previous fix. Returns None when no speed can be determined yet.
    pub fn observe(&mut self, sample: &PositionSample) -> Option<SpeedReading> {
        let fix = (sample.latitude, sample.longitude, sample.timestamp);
        let derived = self.last_fix.and_then(|prev| speed_kmh_between(prev, fix));
        self.last_fix = Some(fix);

        let (speed_kmh, source) = if let Some(sim) = self.simulated_speed_kmh {
            (sim, SpeedSource::Simulated)
        } else if let Some(reported) = sample.speed_kmh {
            (reported, SpeedSource::Reported)
        } else {
            (derived?, SpeedSource::Derived)
        };

        let alert = self.check(speed_kmh, sample.timestamp);
        Some(SpeedReading {
            speed_kmh,
            source,
            alert,
        })
    }

    /// Compare a speed against the limit at the given time (unix seconds)
    pub fn check(&mut self, speed_kmh: f64, timestamp: f64) -> SpeedAlert {
        self.current_speed_kmh = speed_kmh;

        if speed_kmh > self.limit_kmh {
            self.state.violation_count += 1;
            let cooled = self
                .state
                .last_alert_at
                .map_or(true, |t| timestamp - t > self.cooldown_secs);
            if !self.state.overspeed_active || cooled {
                self.state.overspeed_active = true;
                self.state.last_alert_at = Some(timestamp);
                return SpeedAlert::Raised;
            }
            return SpeedAlert::Active;
        }

        if self.state.overspeed_active {
            self.state.overspeed_active = false;
            return SpeedAlert::Cleared;
        }
        SpeedAlert::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_meters;

    #[test]
    fn test_sustained_overspeed_debounced() {
        let mut m = SpeedMonitor::new(60.0);
        let mut raised = Vec::new();
        // 10 Hz for 4 seconds at 80 km/h
        for i in 0..40 {
            let t = 100.0 + i as f64 * 0.1;
            if m.check(80.0, t) == SpeedAlert::Raised {
                raised.push(t);
            }
        }
        assert_eq!(raised.len(), 3);
        for pair in raised.windows(2) {
            assert!(pair[1] - pair[0] > DEFAULT_OVERSPEED_COOLDOWN_SECS);
        }
        assert_eq!(m.state().violation_count, 40);
        assert!(m.is_overspeed());
    }

    #[test]
    fn test_clears_on_next_sample_under_limit() {
        let mut m = SpeedMonitor::new(60.0);
        assert_eq!(m.check(70.0, 0.0), SpeedAlert::Raised);
        assert_eq!(m.check(70.0, 0.5), SpeedAlert::Active);
        assert_eq!(m.check(60.0, 0.6), SpeedAlert::Cleared);
        assert!(!m.is_overspeed());
        assert_eq!(m.check(50.0, 0.7), SpeedAlert::Normal);
        // Violation counter survives the reset for diagnostics
        assert_eq!(m.state().violation_count, 2);
    }

    #[test]
    fn test_reactivates_immediately_after_clear() {
        let mut m = SpeedMonitor::new(60.0);
        assert_eq!(m.check(70.0, 0.0), SpeedAlert::Raised);
        assert_eq!(m.check(40.0, 0.2), SpeedAlert::Cleared);
        assert_eq!(m.check(70.0, 0.4), SpeedAlert::Raised);
    }

    #[test]
    fn test_limit_change_applies_without_restart() {
        let mut m = SpeedMonitor::new(60.0);
        assert_eq!(m.check(70.0, 0.0), SpeedAlert::Raised);
        m.set_limit(80.0);
        assert_eq!(m.limit_kmh(), 80.0);
        assert_eq!(m.check(70.0, 0.1), SpeedAlert::Cleared);
    }

    #[test]
    fn test_derived_speed_from_consecutive_fixes() {
        let mut m = SpeedMonitor::new(60.0);
        let first = PositionSample::new(10.0, 10.0, None, 0.0);
        assert!(m.observe(&first).is_none());

        // 250 m in 10 s = 90 km/h
        let (lat, lon) = offset_meters(10.0, 10.0, 250.0, 0.0);
        let reading = m.observe(&PositionSample::new(lat, lon, None, 10.0)).unwrap();
        assert_eq!(reading.source, SpeedSource::Derived);
        assert!((reading.speed_kmh - 90.0).abs() < 0.1);
        assert_eq!(reading.alert, SpeedAlert::Raised);
    }

    #[test]
    fn test_speed_source_precedence() {
        let mut m = SpeedMonitor::new(60.0);
        let reading = m.observe(&PositionSample::new(1.0, 1.0, Some(30.0), 0.0)).unwrap();
        assert_eq!(reading.source, SpeedSource::Reported);
        assert_eq!(reading.alert, SpeedAlert::Normal);

        m.set_simulated_speed(Some(120.0));
        let reading = m.observe(&PositionSample::new(1.0, 1.0, Some(30.0), 1.0)).unwrap();
        assert_eq!(reading.source, SpeedSource::Simulated);
        assert_eq!(reading.alert, SpeedAlert::Raised);

        m.set_simulated_speed(None);
        let reading = m.observe(&PositionSample::new(1.0, 1.0, Some(30.0), 2.0)).unwrap();
        assert_eq!(reading.source, SpeedSource::Reported);
        assert_eq!(reading.alert, SpeedAlert::Cleared);
    }
}
