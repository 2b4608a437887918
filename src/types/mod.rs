pub mod ingest;

pub use ingest::{normalize_checkpoints, IngestRejection, RawCheckpoint, RawPosition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fallback geofence radius when a checkpoint carries none (meters)
pub const DEFAULT_RADIUS_M: f64 = 10.0;

/// Identifies the active (event, category) pair of a tracking run
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventContext {
    pub event_id: String,
    pub category_id: String,
}

impl EventContext {
    pub fn new(event_id: impl Into<String>, category_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            category_id: category_id.into(),
        }
    }
}

/// Checkpoint reference data, validated at ingestion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub event_id: String,
    pub category_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_radius_meters: Option<f64>,
    pub sequence_number: u32,
    pub description: String,
    pub color: Option<String>,
}

impl Checkpoint {
    /// Geofence radius: own radius when positive, otherwise the 10 m default
    pub fn effective_radius(&self) -> f64 {
        match self.accuracy_radius_meters {
            Some(r) if r.is_finite() && r > 0.0 => r,
            _ => DEFAULT_RADIUS_M,
        }
    }

    pub fn has_valid_coordinates(&self) -> bool {
        valid_coordinates(self.latitude, self.longitude)
    }
}

/// A single position fix from the location source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported ground speed; None when the source has no speed
    pub speed_kmh: Option<f64>,
    /// Unix seconds
    pub timestamp: f64,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, speed_kmh: Option<f64>, timestamp: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed_kmh,
            timestamp,
        }
    }

    pub fn is_valid(&self) -> bool {
        valid_coordinates(self.latitude, self.longitude) && self.timestamp.is_finite()
    }
}

pub(crate) fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Completion status, ordered: transitions only move forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    NotReached,
    Reached,
    Synced,
}

impl CompletionStatus {
    /// REACHED or SYNCED
    pub fn is_completed(self) -> bool {
        self != CompletionStatus::NotReached
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::NotReached => "not_reached",
            CompletionStatus::Reached => "reached",
            CompletionStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_reached" => Some(CompletionStatus::NotReached),
            "reached" => Some(CompletionStatus::Reached),
            "synced" => Some(CompletionStatus::Synced),
            _ => None,
        }
    }
}

/// Ledger key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionKey {
    pub event_id: String,
    pub checkpoint_id: String,
}

impl CompletionKey {
    pub fn new(event_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }
}

/// One durable arrival record, keyed by (event_id, checkpoint_id)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointCompletion {
    pub event_id: String,
    pub category_id: String,
    pub checkpoint_id: String,
    pub checkpoint_name: String,
    pub arrived_at: DateTime<Utc>,
    pub status: CompletionStatus,
    /// Overspeed alert was active at the moment of arrival
    pub over_speed: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl CheckpointCompletion {
    /// Fresh REACHED record for a checkpoint of the given run
    pub fn reached(
        event: &EventContext,
        checkpoint: &Checkpoint,
        arrived_at: DateTime<Utc>,
        over_speed: bool,
    ) -> Self {
        Self {
            event_id: event.event_id.clone(),
            category_id: event.category_id.clone(),
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            checkpoint_name: checkpoint.name.clone(),
            arrived_at,
            status: CompletionStatus::Reached,
            over_speed,
            synced_at: None,
        }
    }

    pub fn key(&self) -> CompletionKey {
        CompletionKey::new(self.event_id.clone(), self.checkpoint_id.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_checkpoint(id: &str, lat: f64, lon: f64, radius: Option<f64>) -> Checkpoint {
    Checkpoint {
        checkpoint_id: id.to_string(),
        event_id: "ev-1".to_string(),
        category_id: "cat-1".to_string(),
        name: format!("CP {}", id),
        latitude: lat,
        longitude: lon,
        accuracy_radius_meters: radius,
        sequence_number: 0,
        description: String::new(),
        color: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_radius_fallback() {
        assert_eq!(test_checkpoint("a", 0.0, 0.0, None).effective_radius(), 10.0);
        assert_eq!(test_checkpoint("a", 0.0, 0.0, Some(0.0)).effective_radius(), 10.0);
        assert_eq!(test_checkpoint("a", 0.0, 0.0, Some(-3.0)).effective_radius(), 10.0);
        assert_eq!(test_checkpoint("a", 0.0, 0.0, Some(25.0)).effective_radius(), 25.0);
    }

    #[test]
    fn test_status_order_is_forward() {
        assert!(CompletionStatus::NotReached < CompletionStatus::Reached);
        assert!(CompletionStatus::Reached < CompletionStatus::Synced);
        assert!(!CompletionStatus::NotReached.is_completed());
        assert!(CompletionStatus::Synced.is_completed());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            CompletionStatus::NotReached,
            CompletionStatus::Reached,
            CompletionStatus::Synced,
        ] {
            assert_eq!(CompletionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CompletionStatus::parse("completed"), None);
    }

    #[test]
    fn test_position_validity() {
        assert!(PositionSample::new(45.0, 7.0, None, 1.0).is_valid());
        assert!(!PositionSample::new(95.0, 7.0, None, 1.0).is_valid());
        assert!(!PositionSample::new(f64::NAN, 7.0, None, 1.0).is_valid());
    }
}
