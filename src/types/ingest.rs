//! Boundary normalization for loosely-typed event data.
//!
//! The event API returns checkpoints with ids as numbers or strings,
//! coordinates as numeric strings, and several alternative field names.
//! Everything is resolved here once; downstream code only sees the strict
//! [`Checkpoint`] and [`PositionSample`] shapes.

use serde::Deserialize;
use serde_json::Value;

use super::{valid_coordinates, Checkpoint, EventContext, PositionSample};
use crate::error::{TResult, TrackerError};

/// Checkpoint as delivered by the event configuration API.
///
/// Alternative field names are kept as separate fields because one row may
/// carry several of them (a storage row `id` next to `checkpoint_id`, both
/// `latitude` and `lat`). [`RawCheckpoint::normalize`] resolves them in
/// order of preference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCheckpoint {
    pub checkpoint_id: Option<Value>,
    pub id: Option<Value>,
    pub event_id: Option<Value>,
    pub category_id: Option<Value>,
    pub name: Option<Value>,
    pub checkpoint_name: Option<Value>,
    pub latitude: Option<Value>,
    pub lat: Option<Value>,
    pub longitude: Option<Value>,
    pub lng: Option<Value>,
    pub lon: Option<Value>,
    pub accuracy_radius_meters: Option<Value>,
    pub radius: Option<Value>,
    pub accuracy: Option<Value>,
    pub sequence_number: Option<Value>,
    pub sequence: Option<Value>,
    pub description: Option<Value>,
    pub color: Option<Value>,
    /// Set when the record could not be read at all
    #[serde(skip)]
    pub parse_error: Option<String>,
}

/// A checkpoint dropped during ingestion, with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRejection {
    pub index: usize,
    pub checkpoint_id: Option<String>,
    pub reason: String,
}

impl RawCheckpoint {
    /// Placeholder for a list entry that failed to deserialize
    pub fn unparseable(reason: impl Into<String>) -> Self {
        RawCheckpoint {
            parse_error: Some(reason.into()),
            ..RawCheckpoint::default()
        }
    }

    /// `checkpoint_id`, falling back to the row `id`
    pub fn resolved_id(&self) -> Option<String> {
        first_of(&[&self.checkpoint_id, &self.id], non_empty_string)
    }

    /// Validate into a strict checkpoint.
    ///
    /// Missing event/category ids are taken from `event`.
    pub fn normalize(&self, event: &EventContext) -> TResult<Checkpoint> {
        if let Some(reason) = &self.parse_error {
            return Err(TrackerError::InvalidCheckpoint(format!(
                "unreadable record: {}",
                reason
            )));
        }

        let checkpoint_id = self
            .resolved_id()
            .ok_or_else(|| TrackerError::InvalidCheckpoint("missing checkpoint id".to_string()))?;

        let latitude = first_of(&[&self.latitude, &self.lat], value_as_f64).ok_or_else(|| {
            TrackerError::InvalidCheckpoint(format!("{}: unparseable latitude", checkpoint_id))
        })?;
        let longitude = first_of(&[&self.longitude, &self.lng, &self.lon], value_as_f64)
            .ok_or_else(|| {
                TrackerError::InvalidCheckpoint(format!("{}: unparseable longitude", checkpoint_id))
            })?;
        if !valid_coordinates(latitude, longitude) {
            return Err(TrackerError::InvalidCheckpoint(format!(
                "{}: coordinates out of range ({}, {})",
                checkpoint_id, latitude, longitude
            )));
        }

        // A garbage radius falls back to the default rather than dropping the checkpoint
        let accuracy_radius_meters = first_of(
            &[&self.accuracy_radius_meters, &self.radius, &self.accuracy],
            value_as_f64,
        )
        .filter(|r| r.is_finite());

        let sequence_number = first_of(&[&self.sequence_number, &self.sequence], value_as_f64)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u32)
            .unwrap_or(0);

        Ok(Checkpoint {
            checkpoint_id,
            event_id: first_of(&[&self.event_id], non_empty_string)
                .unwrap_or_else(|| event.event_id.clone()),
            category_id: first_of(&[&self.category_id], non_empty_string)
                .unwrap_or_else(|| event.category_id.clone()),
            name: first_of(&[&self.name, &self.checkpoint_name], non_empty_string)
                .unwrap_or_default(),
            latitude,
            longitude,
            accuracy_radius_meters,
            sequence_number,
            description: first_of(&[&self.description], value_as_string).unwrap_or_default(),
            color: first_of(&[&self.color], non_empty_string),
        })
    }
}

/// Normalize a checkpoint list for one (event, category).
///
/// Malformed entries and entries of other categories are skipped; malformed
/// ones are reported as rejections. Duplicate ids keep the first occurrence.
/// The result is ordered by sequence number.
pub fn normalize_checkpoints(
    raw: &[RawCheckpoint],
    event: &EventContext,
) -> (Vec<Checkpoint>, Vec<IngestRejection>) {
    let mut checkpoints: Vec<Checkpoint> = Vec::with_capacity(raw.len());
    let mut rejections = Vec::new();

    for (index, item) in raw.iter().enumerate() {
        match item.normalize(event) {
            Ok(cp) => {
                if cp.category_id != event.category_id || cp.event_id != event.event_id {
                    continue;
                }
                if checkpoints.iter().any(|c| c.checkpoint_id == cp.checkpoint_id) {
                    rejections.push(IngestRejection {
                        index,
                        checkpoint_id: Some(cp.checkpoint_id),
                        reason: "duplicate checkpoint id".to_string(),
                    });
                    continue;
                }
                checkpoints.push(cp);
            }
            Err(e) => {
                log::warn!("Skipping checkpoint #{}: {}", index, e);
                rejections.push(IngestRejection {
                    index,
                    checkpoint_id: item.resolved_id(),
                    reason: e.to_string(),
                });
            }
        }
    }

    checkpoints.sort_by_key(|c| c.sequence_number);
    (checkpoints, rejections)
}

/// Position as delivered by a location source or replay file.
///
/// As with checkpoints, alternative names are separate fields so a record
/// carrying both `lat` and `latitude` still parses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPosition {
    pub latitude: Option<f64>,
    pub lat: Option<f64>,
    pub longitude: Option<f64>,
    pub lng: Option<f64>,
    pub lon: Option<f64>,
    /// km/h
    pub speed_kmh: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: f64,
}

impl RawPosition {
    pub fn normalize(&self) -> TResult<PositionSample> {
        let latitude = self.latitude.or(self.lat);
        let longitude = self.longitude.or(self.lng).or(self.lon);
        let (latitude, longitude) = match (latitude, longitude) {
            (Some(lat), Some(lon)) if valid_coordinates(lat, lon) => (lat, lon),
            (lat, lon) => {
                return Err(TrackerError::InvalidPosition(format!("({:?}, {:?})", lat, lon)))
            }
        };
        if !self.timestamp.is_finite() {
            return Err(TrackerError::InvalidPosition("non-finite timestamp".to_string()));
        }
        // Location sources report negative speed when unknown
        let speed_kmh = self
            .speed_kmh
            .or(self.speed)
            .filter(|s| s.is_finite() && *s >= 0.0);
        Ok(PositionSample::new(latitude, longitude, speed_kmh, self.timestamp))
    }
}

/// First candidate that is present and converts
fn first_of<T, F>(candidates: &[&Option<Value>], convert: F) -> Option<T>
where
    F: Fn(&Value) -> Option<T>,
{
    candidates
        .iter()
        .filter_map(|c| Option::as_ref(*c))
        .find_map(convert)
}

fn non_empty_string(value: &Value) -> Option<String> {
    value_as_string(value).filter(|s| !s.is_empty())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
