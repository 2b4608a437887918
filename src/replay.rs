//! JSON-lines track replay.
//!
//! One record per line, tagged by `type`:
//!
//! ```text
//! {"type": "position", "lat": 28.61, "lng": 77.20, "speed": 32.0, "timestamp": 1700000000.0}
//! {"type": "connectivity", "online": false}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::error::TResult;
use crate::types::{PositionSample, RawPosition};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayRecord {
    Position(RawPosition),
    Connectivity { online: bool },
}

#[derive(Debug, Default)]
pub struct ReplayTrack {
    pub records: Vec<ReplayRecord>,
    /// Lines that failed to parse (1-based line numbers)
    pub skipped_lines: Vec<usize>,
}

impl ReplayTrack {
    pub fn load(path: impl AsRef<Path>) -> TResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut track = ReplayTrack::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ReplayRecord>(line) {
                Ok(record) => track.records.push(record),
                Err(e) => {
                    log::warn!("Skipping replay line {}: {}", idx + 1, e);
                    track.skipped_lines.push(idx + 1);
                }
            }
        }
        track
    }

    pub fn position_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, ReplayRecord::Position(_)))
            .count()
    }
}

/// Longest pause between two replayed samples
const MAX_REPLAY_GAP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    AsFastAsPossible,
    /// Sleep for sample timestamp gaps divided by `speedup`
    Realtime { speedup: f64 },
}

impl Pacing {
    fn delay(self, previous: Option<f64>, current: f64) -> Option<Duration> {
        match (self, previous) {
            (Pacing::Realtime { speedup }, Some(prev)) if speedup > 0.0 && current > prev => {
                let gap = Duration::try_from_secs_f64((current - prev) / speedup)
                    .unwrap_or(MAX_REPLAY_GAP);
                Some(gap.min(MAX_REPLAY_GAP))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplaySummary {
    pub positions_sent: usize,
    pub positions_rejected: usize,
    pub connectivity_changes: usize,
}

/// Feed a track into the session's input channels.
///
/// Before each connectivity change the position queue is allowed to empty so
/// the change lands between the same samples it sits between in the file.
pub async fn feed(
    records: Vec<ReplayRecord>,
    positions: mpsc::Sender<PositionSample>,
    connectivity: watch::Sender<bool>,
    pacing: Pacing,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let mut last_timestamp: Option<f64> = None;

    for record in records {
        match record {
            ReplayRecord::Position(raw) => {
                let sample = match raw.normalize() {
                    Ok(sample) => sample,
                    Err(e) => {
                        log::warn!("Replay position rejected: {}", e);
                        summary.positions_rejected += 1;
                        continue;
                    }
                };
                if let Some(delay) = pacing.delay(last_timestamp, sample.timestamp) {
                    tokio::time::sleep(delay).await;
                }
                last_timestamp = Some(sample.timestamp);
                if positions.send(sample).await.is_err() {
                    log::warn!("Position consumer stopped; ending replay early");
                    break;
                }
                summary.positions_sent += 1;
            }
            ReplayRecord::Connectivity { online } => {
                wait_for_empty_queue(&positions).await;
                connectivity.send_replace(online);
                summary.connectivity_changes += 1;
                tokio::task::yield_now().await;
            }
        }
    }
    wait_for_empty_queue(&positions).await;
    summary
}

async fn wait_for_empty_queue(positions: &mpsc::Sender<PositionSample>) {
    while !positions.is_closed() && positions.capacity() < positions.max_capacity() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
