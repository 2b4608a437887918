//! Ledger → remote reconciliation.
//!
//! Both the immediate post-arrival call and connectivity-triggered drains go
//! through [`SyncEngine::sync_one`], which holds a per-row in-flight marker
//! for the duration of the remote call. Overlapping passes therefore never
//! issue two concurrent calls for the same row, while different rows are
//! synced concurrently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::error::{TResult, TrackerError};
use crate::ledger::{run_blocking, CheckpointLedger};
use crate::remote::{CompletionApi, CompletionRequest, RemoteError};
use crate::types::{CheckpointCompletion, CompletionKey, CompletionStatus};

/// Result of syncing a single ledger row
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    /// Remote accepted and the ledger row is now SYNCED
    Synced,
    /// Row was already SYNCED when its turn came; no remote call made
    AlreadySynced,
    /// Another pass holds this row; no remote call made
    InFlight,
    /// Remote call failed; row stays REACHED for the next trigger
    Failed(RemoteError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: Vec<CompletionKey>,
    pub failed: Vec<CompletionKey>,
    pub skipped: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub remote_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub drains: u64,
}

/// Removes the in-flight marker when the sync attempt ends, however it ends
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<CompletionKey>>,
    key: CompletionKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

pub struct SyncEngine {
    ledger: Arc<CheckpointLedger>,
    api: Arc<dyn CompletionApi>,
    request_timeout: Duration,
    in_flight: Mutex<HashSet<CompletionKey>>,
    remote_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    drains: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        ledger: Arc<CheckpointLedger>,
        api: Arc<dyn CompletionApi>,
        request_timeout: Duration,
    ) -> Self {
        SyncEngine {
            ledger,
            api,
            request_timeout,
            in_flight: Mutex::new(HashSet::new()),
            remote_calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            drains: AtomicU64::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<CheckpointLedger> {
        &self.ledger
    }

    fn claim(&self, key: &CompletionKey) -> TResult<Option<InFlightGuard<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire in-flight lock".to_string()))?;
        if !set.insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            set: &self.in_flight,
            key: key.clone(),
        }))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Push one completion to the remote and mark it synced on success.
    ///
    /// Storage errors are returned; remote failures are reported as
    /// [`SyncOutcome::Failed`] and leave the row untouched.
    pub async fn sync_one(&self, completion: &CheckpointCompletion) -> TResult<SyncOutcome> {
        let key = completion.key();
        let _guard = match self.claim(&key)? {
            Some(guard) => guard,
            None => {
                log::debug!("Sync already in flight for {}/{}", key.event_id, key.checkpoint_id);
                return Ok(SyncOutcome::InFlight);
            }
        };

        // Another pass may have finished this row between listing and claiming
        let lookup = key.clone();
        let current = run_blocking(&self.ledger, move |l| l.get_key(&lookup)).await?;
        match current {
            Some(row) if row.status == CompletionStatus::Synced => {
                return Ok(SyncOutcome::AlreadySynced)
            }
            Some(_) => {}
            None => {
                return Err(TrackerError::UnknownCompletion {
                    event_id: key.event_id,
                    checkpoint_id: key.checkpoint_id,
                })
            }
        }

        let request = CompletionRequest::from(completion);
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let result = match tokio::time::timeout(
            self.request_timeout,
            self.api.mark_checkpoint_complete(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        };

        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Sync failed for checkpoint {} (event {}): {}; will retry on next drain",
                key.checkpoint_id,
                key.event_id,
                e
            );
            return Ok(SyncOutcome::Failed(e));
        }

        let (event_id, checkpoint_id) = (key.event_id.clone(), key.checkpoint_id.clone());
        run_blocking(&self.ledger, move |l| l.mark_synced(&event_id, &checkpoint_id)).await?;
        self.successes.fetch_add(1, Ordering::Relaxed);
        log::info!("Checkpoint {} synced (event {})", key.checkpoint_id, key.event_id);
        Ok(SyncOutcome::Synced)
    }

    /// Sync every unsynced row across all events, concurrently.
    ///
    /// A failing row never aborts the pass. Storage errors on individual rows
    /// are counted as failures; only failing to list the pending rows is an
    /// error for the whole pass.
    pub async fn drain(&self) -> TResult<DrainReport> {
        self.drains.fetch_add(1, Ordering::Relaxed);
        let pending = run_blocking(&self.ledger, |l| l.list_unsynced()).await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }
        log::info!("Draining {} unsynced checkpoint(s)", pending.len());

        let outcomes = join_all(pending.iter().map(|row| self.sync_one(row))).await;

        let mut report = DrainReport {
            attempted: pending.len(),
            ..DrainReport::default()
        };
        for (row, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Ok(SyncOutcome::Synced) => report.synced.push(row.key()),
                Ok(SyncOutcome::AlreadySynced) | Ok(SyncOutcome::InFlight) => report.skipped += 1,
                Ok(SyncOutcome::Failed(_)) => report.failed.push(row.key()),
                Err(e) => {
                    log::error!("Drain: storage error on {}: {}", row.checkpoint_id, e);
                    report.failed.push(row.key());
                }
            }
        }

        log::info!(
            "Drain finished: {} synced, {} failed, {} skipped",
            report.synced.len(),
            report.failed.len(),
            report.skipped
        );
        Ok(report)
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
        }
    }
}
