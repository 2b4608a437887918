use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::TResult;
use crate::session::{TrackingSession, TrackingSnapshot};

/// Flat status record written to disk for external monitors
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub event_id: String,
    pub category_id: String,
    // Progress
    pub checkpoints_completed: usize,
    pub checkpoints_total: usize,
    pub pending_sync: usize,
    pub event_complete: bool,
    pub next_checkpoint_id: Option<String>,
    pub next_checkpoint_distance_m: Option<f64>,
    // Position
    pub samples_processed: u64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    // Speed
    pub speed_kmh: f64,
    pub speed_limit_kmh: f64,
    pub overspeed_active: bool,
    pub violation_count: u64,
    // Sync
    pub online: bool,
    pub remote_calls: u64,
    pub sync_failures: u64,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &TrackingSnapshot, uptime: Duration) -> Self {
        let (next_id, next_distance) = match &snapshot.next_checkpoint {
            Some((id, d)) => (Some(id.clone()), Some((d * 10.0).round() / 10.0)),
            None => (None, None),
        };
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: uptime.as_secs(),
            event_id: snapshot.event_id.clone(),
            category_id: snapshot.category_id.clone(),
            checkpoints_completed: snapshot.completed,
            checkpoints_total: snapshot.total,
            pending_sync: snapshot.pending_sync,
            event_complete: snapshot.event_complete,
            next_checkpoint_id: next_id,
            next_checkpoint_distance_m: next_distance,
            samples_processed: snapshot.samples_processed,
            lat: snapshot.last_position.as_ref().map(|p| p.latitude),
            lon: snapshot.last_position.as_ref().map(|p| p.longitude),
            speed_kmh: snapshot.speed_kmh,
            speed_limit_kmh: snapshot.speed_limit_kmh,
            overspeed_active: snapshot.overspeed_active,
            violation_count: snapshot.violation_count,
            online: snapshot.online,
            remote_calls: snapshot.sync.remote_calls,
            sync_failures: snapshot.sync.failures,
        }
    }

    /// Write via a temp file so readers never see a half-written status
    pub fn save(&self, path: &Path) -> TResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Rewrite the status file every `period` until the task is dropped
pub async fn run_status_writer(session: TrackingSession, path: PathBuf, period: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let status = LiveStatus::from_snapshot(&session.snapshot(), started.elapsed());
        if let Err(e) = status.save(&path) {
            log::warn!("Failed to write live status to {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncStats;
    use crate::types::PositionSample;

    fn snapshot() -> TrackingSnapshot {
        TrackingSnapshot {
            event_id: "ev-1".to_string(),
            category_id: "cat-1".to_string(),
            checkpoints: Vec::new(),
            completed: 2,
            total: 5,
            pending_sync: 1,
            event_complete: false,
            speed_kmh: 42.0,
            speed_limit_kmh: 60.0,
            overspeed_active: false,
            violation_count: 3,
            online: true,
            samples_processed: 120,
            last_position: Some(PositionSample::new(28.61, 77.20, None, 10.0)),
            next_checkpoint: Some(("3".to_string(), 153.456)),
            sync: SyncStats {
                remote_calls: 4,
                successes: 3,
                failures: 1,
                drains: 2,
            },
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_status.json");

        let status = LiveStatus::from_snapshot(&snapshot(), Duration::from_secs(90));
        status.save(&path).unwrap();

        let loaded: LiveStatus =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, status);
        assert_eq!(loaded.uptime_seconds, 90);
        assert_eq!(loaded.next_checkpoint_id.as_deref(), Some("3"));
        assert_eq!(loaded.next_checkpoint_distance_m, Some(153.5));
        assert_eq!(loaded.sync_failures, 1);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
