use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{Checkpoint, CompletionStatus};

/// True exactly when every checkpoint is REACHED or SYNCED.
///
/// An empty checkpoint set is never complete.
pub fn all_checkpoints_complete(
    checkpoints: &[Checkpoint],
    statuses: &HashMap<String, CompletionStatus>,
) -> bool {
    !checkpoints.is_empty()
        && checkpoints.iter().all(|cp| {
            statuses
                .get(&cp.checkpoint_id)
                .map_or(false, |s| s.is_completed())
        })
}

/// One-shot "event complete" latch for a run
#[derive(Debug, Default)]
pub struct EventCompletionWatcher {
    notified: AtomicBool,
}

impl EventCompletionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only on the first call that observes a complete set
    pub fn check(
        &self,
        checkpoints: &[Checkpoint],
        statuses: &HashMap<String, CompletionStatus>,
    ) -> bool {
        if self.notified.load(Ordering::Acquire) {
            return false;
        }
        if !all_checkpoints_complete(checkpoints, statuses) {
            return false;
        }
        self.notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Latch without notifying (run resumed with everything already done)
    pub fn mark_notified(&self) {
        self.notified.store(true, Ordering::Release);
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }
}
