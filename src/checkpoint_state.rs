use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{TResult, TrackerError};
use crate::types::{Checkpoint, CheckpointCompletion, CompletionStatus};

/// In-memory completion projection for one event run.
///
/// Every mutation is a check-and-set under a single lock, so concurrent
/// arrivals for the same checkpoint produce exactly one REACHED transition.
/// Status only moves forward: NOT_REACHED → REACHED → SYNCED.
pub struct CheckpointStateMachine {
    event_id: String,
    statuses: Mutex<HashMap<String, CompletionStatus>>,
}

impl CheckpointStateMachine {
    /// All checkpoints start NOT_REACHED
    pub fn new(event_id: impl Into<String>, checkpoints: &[Checkpoint]) -> Self {
        let statuses = checkpoints
            .iter()
            .map(|cp| (cp.checkpoint_id.clone(), CompletionStatus::NotReached))
            .collect();
        CheckpointStateMachine {
            event_id: event_id.into(),
            statuses: Mutex::new(statuses),
        }
    }

    /// Rebuild the projection from durable ledger rows of this event.
    ///
    /// Rows for checkpoints outside the set are ignored.
    pub fn rehydrate(
        event_id: impl Into<String>,
        checkpoints: &[Checkpoint],
        rows: &[CheckpointCompletion],
    ) -> Self {
        let machine = Self::new(event_id, checkpoints);
        if let Ok(mut statuses) = machine.statuses.lock() {
            for row in rows.iter().filter(|r| r.event_id == machine.event_id) {
                if let Some(status) = statuses.get_mut(&row.checkpoint_id) {
                    if row.status > *status {
                        *status = row.status;
                    }
                } else {
                    log::debug!(
                        "Ledger row for unknown checkpoint {} ignored during rehydrate",
                        row.checkpoint_id
                    );
                }
            }
        }
        machine
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    fn lock(&self) -> TResult<MutexGuard<'_, HashMap<String, CompletionStatus>>> {
        self.statuses.lock().map_err(|_| {
            TrackerError::Internal("Failed to acquire checkpoint state lock".to_string())
        })
    }

    /// NOT_REACHED → REACHED. Returns false (no-op) if already completed.
    pub fn try_mark_reached(&self, checkpoint_id: &str) -> TResult<bool> {
        let mut statuses = self.lock()?;
        let status = statuses
            .get_mut(checkpoint_id)
            .ok_or_else(|| TrackerError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        if *status != CompletionStatus::NotReached {
            return Ok(false);
        }
        *status = CompletionStatus::Reached;
        Ok(true)
    }

    /// REACHED → SYNCED. Returns false if already SYNCED.
    ///
    /// A checkpoint still NOT_REACHED in memory but synced in the ledger
    /// (restart race) jumps forward to SYNCED.
    pub fn mark_synced(&self, checkpoint_id: &str) -> TResult<bool> {
        let mut statuses = self.lock()?;
        let status = statuses
            .get_mut(checkpoint_id)
            .ok_or_else(|| TrackerError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        if *status == CompletionStatus::Synced {
            return Ok(false);
        }
        *status = CompletionStatus::Synced;
        Ok(true)
    }

    pub fn status(&self, checkpoint_id: &str) -> TResult<CompletionStatus> {
        let statuses = self.lock()?;
        statuses
            .get(checkpoint_id)
            .copied()
            .ok_or_else(|| TrackerError::UnknownCheckpoint(checkpoint_id.to_string()))
    }

    pub fn contains(&self, checkpoint_id: &str) -> bool {
        self.lock()
            .map(|s| s.contains_key(checkpoint_id))
            .unwrap_or(false)
    }

    /// Copy of the projection for read-only consumers
    pub fn snapshot(&self) -> TResult<HashMap<String, CompletionStatus>> {
        Ok(self.lock()?.clone())
    }

    /// (completed, total)
    pub fn progress(&self) -> TResult<(usize, usize)> {
        let statuses = self.lock()?;
        let completed = statuses.values().filter(|s| s.is_completed()).count();
        Ok((completed, statuses.len()))
    }
}
