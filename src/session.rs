//! Tracking session: the single owner of checkpoint, sync and speed state
//! for one (event, category) run.
//!
//! Position samples are processed synchronously up to the state machine
//! transition; ledger writes and remote calls are spawned as separate tasks
//! so a slow disk or network never holds up the next sample. UI consumers
//! read state through [`TrackingSession::watch_snapshot`] and
//! [`TrackingSession::subscribe`], never through shared fields.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::checkpoint_state::CheckpointStateMachine;
use crate::completion::{all_checkpoints_complete, EventCompletionWatcher};
use crate::config::TrackerConfig;
use crate::error::{TResult, TrackerError};
use crate::geofence::GeofenceDetector;
use crate::ledger::{run_blocking, CheckpointLedger};
use crate::remote::CompletionApi;
use crate::speed::{SpeedAlert, SpeedMonitor, DEFAULT_OVERSPEED_COOLDOWN_SECS};
use crate::sync::{DrainReport, SyncEngine, SyncOutcome, SyncStats};
use crate::types::{
    Checkpoint, CheckpointCompletion, CompletionKey, CompletionStatus, EventContext,
    PositionSample,
};

/// Ledger insert attempts before a completion is parked for the next drain
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for the UI layer
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    CheckpointReached {
        checkpoint_id: String,
        name: String,
        completed: usize,
        total: usize,
        over_speed: bool,
    },
    CheckpointSynced {
        checkpoint_id: String,
    },
    /// Fired once per run
    EventComplete {
        event_id: String,
        total: usize,
    },
    OverspeedRaised {
        speed_kmh: f64,
        limit_kmh: f64,
    },
    OverspeedCleared {
        speed_kmh: f64,
    },
    /// A completion could not be written; it is held in memory and retried
    StorageFailure {
        checkpoint_id: String,
        message: String,
    },
    ConnectivityChanged {
        online: bool,
    },
    DrainFinished {
        synced: usize,
        failed: usize,
        skipped: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckpointView {
    pub checkpoint_id: String,
    pub name: String,
    pub sequence_number: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub color: Option<String>,
    pub status: CompletionStatus,
}

/// Read-only view of the session published after every change
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackingSnapshot {
    pub event_id: String,
    pub category_id: String,
    pub checkpoints: Vec<CheckpointView>,
    pub completed: usize,
    pub total: usize,
    pub pending_sync: usize,
    pub event_complete: bool,
    pub speed_kmh: f64,
    pub speed_limit_kmh: f64,
    pub overspeed_active: bool,
    pub violation_count: u64,
    pub online: bool,
    pub samples_processed: u64,
    pub last_position: Option<PositionSample>,
    /// Nearest checkpoint not yet reached, with distance in meters
    pub next_checkpoint: Option<(String, f64)>,
    pub sync: SyncStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub speed_limit_kmh: f64,
    pub overspeed_cooldown_secs: f64,
    pub request_timeout: Duration,
    pub drain_interval: Option<Duration>,
    pub initially_online: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            speed_limit_kmh: 60.0,
            overspeed_cooldown_secs: DEFAULT_OVERSPEED_COOLDOWN_SECS,
            request_timeout: Duration::from_secs(10),
            drain_interval: None,
            initially_online: true,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &TrackerConfig, event_limit_kmh: Option<f64>) -> Self {
        SessionOptions {
            speed_limit_kmh: config.effective_speed_limit(event_limit_kmh),
            overspeed_cooldown_secs: config.overspeed_cooldown_secs,
            request_timeout: config.request_timeout(),
            drain_interval: config.drain_interval(),
            initially_online: true,
        }
    }
}

struct SessionInner {
    event: EventContext,
    detector: GeofenceDetector,
    state: CheckpointStateMachine,
    ledger: Arc<CheckpointLedger>,
    sync: SyncEngine,
    watcher: EventCompletionWatcher,
    speed: Mutex<SpeedMonitor>,
    online: AtomicBool,
    samples: AtomicU64,
    drain_interval: Option<Duration>,
    last_position: Mutex<Option<PositionSample>>,
    unpersisted: Mutex<Vec<CheckpointCompletion>>,
    pending_work: Mutex<Vec<JoinHandle<()>>>,
    events_tx: broadcast::Sender<TrackerEvent>,
    snapshot_tx: watch::Sender<TrackingSnapshot>,
}

/// Cloneable handle to a running tracking session
#[derive(Clone)]
pub struct TrackingSession {
    inner: Arc<SessionInner>,
}

impl TrackingSession {
    /// Start a session, rehydrating completion state from the ledger
    pub async fn start(
        event: EventContext,
        checkpoints: Vec<Checkpoint>,
        ledger: Arc<CheckpointLedger>,
        api: Arc<dyn CompletionApi>,
        options: SessionOptions,
    ) -> TResult<Self> {
        if !(options.speed_limit_kmh.is_finite() && options.speed_limit_kmh > 0.0) {
            return Err(TrackerError::InvalidConfig(format!(
                "speed limit must be positive, got {}",
                options.speed_limit_kmh
            )));
        }

        let detector = GeofenceDetector::new(&checkpoints);
        let event_id = event.event_id.clone();
        let rows = run_blocking(&ledger, move |l| l.list_for_event(&event_id)).await?;
        let state = CheckpointStateMachine::rehydrate(
            event.event_id.clone(),
            detector.checkpoints(),
            &rows,
        );

        let watcher = EventCompletionWatcher::new();
        if all_checkpoints_complete(detector.checkpoints(), &state.snapshot()?) {
            // Completion was already announced in the run that finished it
            watcher.mark_notified();
        }

        let (completed, total) = state.progress()?;
        log::info!(
            "Tracking session started: event {} category {}, {}/{} checkpoints already complete",
            event.event_id,
            event.category_id,
            completed,
            total
        );

        let sync = SyncEngine::new(Arc::clone(&ledger), api, options.request_timeout);
        let speed = SpeedMonitor::with_cooldown(
            options.speed_limit_kmh,
            options.overspeed_cooldown_secs,
        );
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(empty_snapshot(&event));

        let inner = Arc::new(SessionInner {
            event,
            detector,
            state,
            ledger,
            sync,
            watcher,
            speed: Mutex::new(speed),
            online: AtomicBool::new(options.initially_online),
            samples: AtomicU64::new(0),
            drain_interval: options.drain_interval,
            last_position: Mutex::new(None),
            unpersisted: Mutex::new(Vec::new()),
            pending_work: Mutex::new(Vec::new()),
            events_tx,
            snapshot_tx,
        });
        inner.publish();
        Ok(TrackingSession { inner })
    }

    pub fn event(&self) -> &EventContext {
        &self.inner.event
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        self.inner.detector.checkpoints()
    }

    pub fn ledger(&self) -> &Arc<CheckpointLedger> {
        &self.inner.ledger
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<TrackingSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn status(&self, checkpoint_id: &str) -> TResult<CompletionStatus> {
        self.inner.state.status(checkpoint_id)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.inner.sync.stats()
    }

    /// Process one position sample: speed check, geofence, arrivals.
    ///
    /// Returns the checkpoints that transitioned to REACHED on this sample.
    pub fn ingest_position(&self, sample: PositionSample) -> TResult<Vec<String>> {
        let inner = &self.inner;
        if !sample.is_valid() {
            return Err(TrackerError::InvalidPosition(format!(
                "({}, {}) at {}",
                sample.latitude, sample.longitude, sample.timestamp
            )));
        }
        inner.samples.fetch_add(1, Ordering::Relaxed);

        let reading = inner.speed()?.observe(&sample);
        if let Some(reading) = reading {
            inner.announce_speed(reading.alert, reading.speed_kmh)?;
        }

        let statuses = inner.state.snapshot()?;
        let arrivals = inner.detector.evaluate(&sample, |id| {
            statuses.get(id).map_or(false, |s| s.is_completed())
        });
        *lock(&inner.last_position, "position")? = Some(sample);

        let mut reached = Vec::new();
        for arrival in arrivals {
            log::debug!(
                "Arrival at {} ({:.1} m inside {:.1} m radius)",
                arrival.checkpoint_id,
                arrival.distance_m,
                arrival.radius_m
            );
            if self.register_arrival(&arrival.checkpoint_id)? {
                reached.push(arrival.checkpoint_id);
            }
        }

        inner.publish();
        Ok(reached)
    }

    /// Manual completion; identical to an automatic arrival.
    ///
    /// Returns false if the checkpoint was already complete.
    pub fn force_mark_complete(&self, checkpoint_id: &str) -> TResult<bool> {
        log::info!("Force-completing checkpoint {}", checkpoint_id);
        let reached = self.register_arrival(checkpoint_id)?;
        self.inner.publish();
        Ok(reached)
    }

    fn register_arrival(&self, checkpoint_id: &str) -> TResult<bool> {
        let inner = &self.inner;
        if !inner.state.try_mark_reached(checkpoint_id)? {
            return Ok(false);
        }

        let checkpoint = inner
            .detector
            .checkpoints()
            .iter()
            .find(|cp| cp.checkpoint_id == checkpoint_id)
            .ok_or_else(|| TrackerError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        let over_speed = inner.speed()?.is_overspeed();
        let completion =
            CheckpointCompletion::reached(&inner.event, checkpoint, Utc::now(), over_speed);

        let (completed, total) = inner.state.progress()?;
        log::info!(
            "Checkpoint {} ({}) reached: {} of {} complete",
            checkpoint.checkpoint_id,
            checkpoint.name,
            completed,
            total
        );
        inner.emit(TrackerEvent::CheckpointReached {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            name: checkpoint.name.clone(),
            completed,
            total,
            over_speed,
        });
        inner.evaluate_completion()?;

        let task = Arc::clone(inner);
        inner.track(tokio::spawn(async move {
            task.persist_and_sync(completion).await;
        }));
        Ok(true)
    }

    /// Connectivity update; a false → true edge triggers a drain
    pub fn set_connectivity(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was == online {
            return;
        }
        log::info!("Connectivity {}", if online { "restored" } else { "lost" });
        self.inner.emit(TrackerEvent::ConnectivityChanged { online });
        self.inner.publish();
        if online {
            self.spawn_drain();
        }
    }

    pub fn spawn_drain(&self) {
        let task = Arc::clone(&self.inner);
        self.inner.track(tokio::spawn(async move {
            if let Err(e) = task.drain().await {
                log::error!("Drain pass failed: {}", e);
            }
        }));
    }

    /// Run one drain pass now and wait for it
    pub async fn drain_now(&self) -> TResult<DrainReport> {
        self.inner.drain().await
    }

    pub fn set_speed_limit(&self, limit_kmh: f64) -> TResult<()> {
        if !(limit_kmh.is_finite() && limit_kmh > 0.0) {
            return Err(TrackerError::InvalidConfig(format!(
                "speed limit must be positive, got {}",
                limit_kmh
            )));
        }
        self.inner.speed()?.set_limit(limit_kmh);
        self.inner.publish();
        Ok(())
    }

    pub fn set_simulated_speed(&self, speed_kmh: Option<f64>) -> TResult<()> {
        self.inner.speed()?.set_simulated_speed(speed_kmh);
        Ok(())
    }

    /// Check an externally supplied speed without a position fix
    pub fn inject_speed(&self, speed_kmh: f64, timestamp: f64) -> TResult<SpeedAlert> {
        let alert = self.inner.speed()?.check(speed_kmh, timestamp);
        self.inner.announce_speed(alert, speed_kmh)?;
        self.inner.publish();
        Ok(alert)
    }

    /// Consume position and connectivity streams until the position stream ends
    pub async fn run(
        &self,
        mut positions: mpsc::Receiver<PositionSample>,
        mut connectivity: watch::Receiver<bool>,
    ) {
        let initial = *connectivity.borrow_and_update();
        let was_online = self.is_online();
        self.set_connectivity(initial);
        if initial && was_online {
            // No edge to trigger on; rows left from earlier runs still need a pass
            self.spawn_drain();
        }

        let mut drain_timer = self
            .inner
            .drain_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut timer = interval(period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                timer
            });
        let mut connectivity_open = true;

        loop {
            tokio::select! {
                sample = positions.recv() => match sample {
                    Some(sample) => {
                        if let Err(e) = self.ingest_position(sample) {
                            log::warn!("Position sample rejected: {}", e);
                        }
                    }
                    None => break,
                },
                changed = connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        let online = *connectivity.borrow_and_update();
                        self.set_connectivity(online);
                    }
                    Err(_) => connectivity_open = false,
                },
                _ = next_tick(&mut drain_timer) => {
                    if self.is_online() {
                        self.spawn_drain();
                    }
                }
            }
        }
        log::info!("Position stream closed");
    }

    /// Wait for every spawned ledger/sync task to finish
    pub async fn settle(&self) {
        loop {
            let handles = match self.inner.pending_work.lock() {
                Ok(mut work) => std::mem::take(&mut *work),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        log::error!("Session task panicked: {}", e);
                    }
                }
            }
        }
    }

    /// Abandon in-flight work. Remote calls are idempotent, so anything cut
    /// short here is retried by the next session's drain.
    pub fn shutdown(&self) {
        if let Ok(mut work) = self.inner.pending_work.lock() {
            for handle in work.drain(..) {
                handle.abort();
            }
        }
        log::info!("Tracking session for event {} stopped", self.inner.event.event_id);
    }
}

impl SessionInner {
    fn speed(&self) -> TResult<MutexGuard<'_, SpeedMonitor>> {
        lock(&self.speed, "speed monitor")
    }

    fn emit(&self, event: TrackerEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut work) = self.pending_work.lock() {
            work.retain(|h| !h.is_finished());
            work.push(handle);
        }
    }

    fn announce_speed(&self, alert: SpeedAlert, speed_kmh: f64) -> TResult<()> {
        match alert {
            SpeedAlert::Raised => {
                let limit_kmh = self.speed()?.limit_kmh();
                log::warn!("Overspeed: {:.1} km/h (limit {:.1})", speed_kmh, limit_kmh);
                self.emit(TrackerEvent::OverspeedRaised {
                    speed_kmh,
                    limit_kmh,
                });
            }
            SpeedAlert::Cleared => {
                log::info!("Back under speed limit: {:.1} km/h", speed_kmh);
                self.emit(TrackerEvent::OverspeedCleared { speed_kmh });
            }
            SpeedAlert::Normal | SpeedAlert::Active => {}
        }
        Ok(())
    }

    fn evaluate_completion(&self) -> TResult<()> {
        let statuses = self.state.snapshot()?;
        if self.watcher.check(self.detector.checkpoints(), &statuses) {
            let total = self.detector.checkpoints().len();
            log::info!(
                "Event {} complete: all {} checkpoints reached",
                self.event.event_id,
                total
            );
            self.emit(TrackerEvent::EventComplete {
                event_id: self.event.event_id.clone(),
                total,
            });
        }
        Ok(())
    }

    async fn persist(&self, completion: &CheckpointCompletion) -> TResult<bool> {
        let mut attempt = 1;
        loop {
            let row = completion.clone();
            match run_blocking(&self.ledger, move |l| l.insert_if_absent(&row)).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    log::warn!(
                        "Ledger write for {} failed (attempt {}): {}",
                        completion.checkpoint_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist_and_sync(&self, completion: CheckpointCompletion) {
        match self.persist(&completion).await {
            Ok(true) => {}
            Ok(false) => {
                self.reconcile_existing(&completion.key()).await;
                return;
            }
            Err(e) => {
                self.park_unpersisted(completion, &e);
                return;
            }
        }

        if !self.online.load(Ordering::Acquire) {
            log::debug!(
                "Offline: checkpoint {} recorded locally, sync deferred",
                completion.checkpoint_id
            );
            self.publish();
            return;
        }
        self.sync_completion(&completion).await;
    }

    fn park_unpersisted(&self, completion: CheckpointCompletion, error: &TrackerError) {
        log::error!(
            "Could not record checkpoint {} in ledger: {}; holding for retry",
            completion.checkpoint_id,
            error
        );
        self.emit(TrackerEvent::StorageFailure {
            checkpoint_id: completion.checkpoint_id.clone(),
            message: error.to_string(),
        });
        if let Ok(mut parked) = self.unpersisted.lock() {
            if !parked.iter().any(|c| c.key() == completion.key()) {
                parked.push(completion);
            }
        }
    }

    /// A row for this key already existed: align memory with the ledger
    async fn reconcile_existing(&self, key: &CompletionKey) {
        let lookup = key.clone();
        match run_blocking(&self.ledger, move |l| l.get_key(&lookup)).await {
            Ok(Some(row)) if row.status == CompletionStatus::Synced => self.apply_synced(key),
            Ok(Some(row)) => {
                if self.online.load(Ordering::Acquire) {
                    self.sync_completion(&row).await;
                }
            }
            Ok(None) => log::warn!("Ledger row for {} vanished", key.checkpoint_id),
            Err(e) => log::error!("Ledger lookup for {} failed: {}", key.checkpoint_id, e),
        }
    }

    async fn sync_completion(&self, completion: &CheckpointCompletion) {
        match self.sync.sync_one(completion).await {
            Ok(SyncOutcome::Synced) | Ok(SyncOutcome::AlreadySynced) => {
                self.apply_synced(&completion.key())
            }
            Ok(SyncOutcome::InFlight) | Ok(SyncOutcome::Failed(_)) => self.publish(),
            Err(e) => log::error!(
                "Sync of checkpoint {} hit a storage error: {}",
                completion.checkpoint_id,
                e
            ),
        }
    }

    fn apply_synced(&self, key: &CompletionKey) {
        if key.event_id != self.event.event_id {
            return;
        }
        match self.state.mark_synced(&key.checkpoint_id) {
            Ok(true) => {
                self.emit(TrackerEvent::CheckpointSynced {
                    checkpoint_id: key.checkpoint_id.clone(),
                });
                if let Err(e) = self.evaluate_completion() {
                    log::error!("Completion check failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => log::debug!("Synced row not tracked by this session: {}", e),
        }
        self.publish();
    }

    async fn retry_unpersisted(&self) {
        let parked = match self.unpersisted.lock() {
            Ok(mut parked) => std::mem::take(&mut *parked),
            Err(_) => return,
        };
        for completion in parked {
            let row = completion.clone();
            match run_blocking(&self.ledger, move |l| l.insert_if_absent(&row)).await {
                Ok(_) => log::info!(
                    "Checkpoint {} recorded in ledger after earlier failure",
                    completion.checkpoint_id
                ),
                Err(e) => self.park_unpersisted(completion, &e),
            }
        }
    }

    async fn drain(&self) -> TResult<DrainReport> {
        self.retry_unpersisted().await;
        let report = self.sync.drain().await?;
        for key in &report.synced {
            self.apply_synced(key);
        }
        self.emit(TrackerEvent::DrainFinished {
            synced: report.synced.len(),
            failed: report.failed.len(),
            skipped: report.skipped,
        });
        self.publish();
        Ok(report)
    }

    fn build_snapshot(&self) -> TResult<TrackingSnapshot> {
        let statuses = self.state.snapshot()?;
        let checkpoints: Vec<CheckpointView> = self
            .detector
            .checkpoints()
            .iter()
            .map(|cp| CheckpointView {
                checkpoint_id: cp.checkpoint_id.clone(),
                name: cp.name.clone(),
                sequence_number: cp.sequence_number,
                latitude: cp.latitude,
                longitude: cp.longitude,
                radius_m: cp.effective_radius(),
                color: cp.color.clone(),
                status: statuses
                    .get(&cp.checkpoint_id)
                    .copied()
                    .unwrap_or(CompletionStatus::NotReached),
            })
            .collect();
        let completed = checkpoints.iter().filter(|c| c.status.is_completed()).count();
        let pending_sync = checkpoints
            .iter()
            .filter(|c| c.status == CompletionStatus::Reached)
            .count();

        let last_position = lock(&self.last_position, "position")?.clone();
        let next_checkpoint = last_position.as_ref().and_then(|p| {
            self.detector.nearest_pending(p, |id| {
                statuses.get(id).map_or(false, |s| s.is_completed())
            })
        });

        let speed = self.speed()?;
        Ok(TrackingSnapshot {
            event_id: self.event.event_id.clone(),
            category_id: self.event.category_id.clone(),
            total: checkpoints.len(),
            completed,
            pending_sync,
            checkpoints,
            event_complete: self.watcher.is_notified(),
            speed_kmh: speed.current_speed_kmh(),
            speed_limit_kmh: speed.limit_kmh(),
            overspeed_active: speed.is_overspeed(),
            violation_count: speed.state().violation_count,
            online: self.online.load(Ordering::Acquire),
            samples_processed: self.samples.load(Ordering::Relaxed),
            last_position,
            next_checkpoint,
            sync: self.sync.stats(),
        })
    }

    fn publish(&self) {
        match self.build_snapshot() {
            Ok(snapshot) => {
                self.snapshot_tx.send_replace(snapshot);
            }
            Err(e) => log::error!("Snapshot build failed: {}", e),
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> TResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| TrackerError::Internal(format!("Failed to acquire {} lock", what)))
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn empty_snapshot(event: &EventContext) -> TrackingSnapshot {
    TrackingSnapshot {
        event_id: event.event_id.clone(),
        category_id: event.category_id.clone(),
        checkpoints: Vec::new(),
        completed: 0,
        total: 0,
        pending_sync: 0,
        event_complete: false,
        speed_kmh: 0.0,
        speed_limit_kmh: 0.0,
        overspeed_active: false,
        violation_count: 0,
        online: false,
        samples_processed: 0,
        last_position: None,
        next_checkpoint: None,
        sync: SyncStats::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_meters;
    use crate::remote::testing::ScriptedApi;
    use crate::types::test_checkpoint;

    const LAT: f64 = 28.6139;
    const LON: f64 = 77.2090;

    /// Three checkpoints 200 m apart along a line, default 10 m radius
    fn route() -> Vec<Checkpoint> {
        (0..3)
            .map(|i| {
                let (lat, lon) = offset_meters(LAT, LON, 200.0 * i as f64, 0.0);
                let mut cp = test_checkpoint(&(i + 1).to_string(), lat, lon, None);
                cp.sequence_number = i as u32 + 1;
                cp
            })
            .collect()
    }

    fn at_checkpoint(index: usize, jitter_m: f64, t: f64) -> PositionSample {
        let (lat, lon) = offset_meters(LAT, LON, 200.0 * index as f64 + jitter_m, jitter_m);
        PositionSample::new(lat, lon, Some(20.0), t)
    }

    async fn start_with(
        ledger: Arc<CheckpointLedger>,
        api: Arc<ScriptedApi>,
        online: bool,
    ) -> TrackingSession {
        let options = SessionOptions {
            initially_online: online,
            request_timeout: Duration::from_millis(500),
            ..SessionOptions::default()
        };
        TrackingSession::start(
            EventContext::new("ev-1", "cat-1"),
            route(),
            ledger,
            api,
            options,
        )
        .await
        .unwrap()
    }

    fn drain_events(rx: &mut broadcast::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_jitter_inside_radius_records_once() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        api.fail_checkpoint("2");
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;

        assert_eq!(session.ingest_position(at_checkpoint(1, 2.0, 1.0)).unwrap(), vec!["2"]);
        assert!(session.ingest_position(at_checkpoint(1, -3.0, 2.0)).unwrap().is_empty());
        session.settle().await;

        let rows = ledger.list_for_event("ev-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].checkpoint_id, "2");
        assert_eq!(rows[0].status, CompletionStatus::Reached);
        assert_eq!(api.calls_for("2"), 1);
        assert_eq!(session.status("2").unwrap(), CompletionStatus::Reached);
    }

    #[tokio::test]
    async fn test_online_arrival_syncs_immediately() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;
        let mut events = session.subscribe();

        session.ingest_position(at_checkpoint(0, 0.0, 1.0)).unwrap();
        session.ingest_position(at_checkpoint(0, 1.0, 2.0)).unwrap();
        session.settle().await;

        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(
            ledger.get("ev-1", "1").unwrap().unwrap().status,
            CompletionStatus::Synced
        );
        assert_eq!(api.calls_for("1"), 1);

        let events = drain_events(&mut events);
        assert!(events.contains(&TrackerEvent::CheckpointSynced {
            checkpoint_id: "1".to_string()
        }));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.pending_sync, 0);
        assert_eq!(snapshot.next_checkpoint.map(|(id, _)| id), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_offline_then_connectivity_restore_drains_all() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), false).await;

        for (i, t) in [(0, 1.0), (1, 2.0), (2, 3.0)] {
            session.ingest_position(at_checkpoint(i, 0.0, t)).unwrap();
        }
        session.settle().await;

        assert_eq!(ledger.count_unsynced().unwrap(), 3);
        assert!(api.calls().is_empty());
        assert!(session.snapshot().event_complete);

        session.set_connectivity(true);
        session.settle().await;

        assert_eq!(ledger.count_unsynced().unwrap(), 0);
        assert_eq!(api.calls().len(), 3);
        for id in ["1", "2", "3"] {
            assert_eq!(api.calls_for(id), 1);
            assert_eq!(session.status(id).unwrap(), CompletionStatus::Synced);
        }
    }

    #[tokio::test]
    async fn test_event_complete_fires_once_on_last_checkpoint() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(ledger, api, true).await;
        let mut rx = session.subscribe();

        for (i, t) in [(0, 1.0), (1, 2.0), (1, 2.5), (2, 3.0), (2, 4.0)] {
            session.ingest_position(at_checkpoint(i, 0.0, t)).unwrap();
        }
        session.settle().await;
        session.force_mark_complete("3").unwrap();
        session.drain_now().await.unwrap();

        let events = drain_events(&mut rx);
        let complete: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, TrackerEvent::EventComplete { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(complete.len(), 1);

        let third_reached = events
            .iter()
            .position(|e| {
                matches!(e, TrackerEvent::CheckpointReached { completed: 3, total: 3, .. })
            })
            .unwrap();
        assert_eq!(complete[0], third_reached + 1);
    }

    #[tokio::test]
    async fn test_force_mark_complete_shares_arrival_path() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;

        assert!(session.force_mark_complete("2").unwrap());
        assert!(!session.force_mark_complete("2").unwrap());
        // A later physical arrival is a no-op too
        assert!(session.ingest_position(at_checkpoint(1, 0.0, 1.0)).unwrap().is_empty());
        assert!(matches!(
            session.force_mark_complete("99"),
            Err(TrackerError::UnknownCheckpoint(_))
        ));
        session.settle().await;

        assert_eq!(ledger.list_for_event("ev-1").unwrap().len(), 1);
        assert_eq!(api.calls_for("2"), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_waits_for_next_trigger() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        api.set_offline(true);
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;

        session.force_mark_complete("1").unwrap();
        session.settle().await;
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);
        assert_eq!(api.calls_for("1"), 1);

        // No retry without a trigger
        session.ingest_position(at_checkpoint(0, 0.0, 5.0)).unwrap();
        session.settle().await;
        assert_eq!(api.calls_for("1"), 1);

        api.set_offline(false);
        session.set_connectivity(false);
        session.set_connectivity(true);
        session.settle().await;
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(api.calls_for("1"), 2);
    }

    #[tokio::test]
    async fn test_restart_rehydrates_from_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let api = Arc::new(ScriptedApi::new());

        {
            let ledger = Arc::new(CheckpointLedger::open(&path).unwrap());
            let session = start_with(ledger, api.clone(), false).await;
            session.ingest_position(at_checkpoint(0, 0.0, 1.0)).unwrap();
            session.settle().await;
            session.shutdown();
        }

        let ledger = Arc::new(CheckpointLedger::open(&path).unwrap());
        let session = start_with(Arc::clone(&ledger), api.clone(), false).await;
        let mut rx = session.subscribe();
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);
        assert_eq!(session.snapshot().completed, 1);

        assert!(session.ingest_position(at_checkpoint(0, 1.0, 2.0)).unwrap().is_empty());
        session.settle().await;
        assert!(drain_events(&mut rx).is_empty());

        session.set_connectivity(true);
        session.settle().await;
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(api.calls_for("1"), 1);
        assert_eq!(ledger.list_for_event("ev-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_complete_event_does_not_refire() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let event = EventContext::new("ev-1", "cat-1");
        for cp in route() {
            ledger
                .insert_if_absent(&CheckpointCompletion::reached(&event, &cp, Utc::now(), false))
                .unwrap();
        }

        let session = start_with(ledger, api, true).await;
        let mut rx = session.subscribe();
        assert!(session.snapshot().event_complete);
        session.drain_now().await.unwrap();
        let events = drain_events(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, TrackerEvent::EventComplete { .. })));
    }

    #[tokio::test]
    async fn test_overspeed_alert_and_flag_on_completion() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api, false).await;
        let mut rx = session.subscribe();

        session.set_simulated_speed(Some(95.0)).unwrap();
        session.ingest_position(at_checkpoint(0, 50.0, 1.0)).unwrap();
        session.ingest_position(at_checkpoint(0, 0.0, 1.5)).unwrap();
        session.settle().await;

        let snapshot = session.snapshot();
        assert!(snapshot.overspeed_active);
        assert_eq!(snapshot.violation_count, 2);
        assert!(ledger.get("ev-1", "1").unwrap().unwrap().over_speed);

        session.set_speed_limit(100.0).unwrap();
        session.ingest_position(at_checkpoint(0, 60.0, 2.0)).unwrap();
        assert!(!session.snapshot().overspeed_active);

        let events = drain_events(&mut rx);
        let raised = events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::OverspeedRaised { .. }))
            .count();
        assert_eq!(raised, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, TrackerEvent::OverspeedCleared { .. })));
        assert!(session.set_speed_limit(0.0).is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_is_held_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let ledger = Arc::new(CheckpointLedger::open(&path).unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), false).await;
        let mut rx = session.subscribe();

        let saboteur = rusqlite::Connection::open(&path).unwrap();
        saboteur
            .execute_batch("DROP TABLE checkpoint_completions;")
            .unwrap();

        session.force_mark_complete("1").unwrap();
        session.settle().await;
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, TrackerEvent::StorageFailure { .. })));
        // Still complete in memory; the arrival is not lost
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);

        // Reopening recreates the schema; the next drain writes and syncs the row
        drop(CheckpointLedger::open(&path).unwrap());
        session.set_connectivity(true);
        session.settle().await;
        session.drain_now().await.unwrap();

        assert!(ledger.get("ev-1", "1").unwrap().is_some());
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(api.calls_for("1"), 1);
    }

    #[tokio::test]
    async fn test_run_loop_consumes_both_streams() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;

        let (pos_tx, pos_rx) = mpsc::channel(64);
        let (net_tx, net_rx) = watch::channel(false);
        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.run(pos_rx, net_rx).await })
        };

        pos_tx.send(at_checkpoint(0, 0.0, 1.0)).await.unwrap();
        pos_tx.send(at_checkpoint(1, 0.0, 2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.settle().await;
        assert_eq!(api.calls().len(), 0);
        assert_eq!(ledger.count_unsynced().unwrap(), 2);

        net_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(pos_tx);
        runner.await.unwrap();
        session.settle().await;

        assert_eq!(ledger.count_unsynced().unwrap(), 0);
        assert_eq!(api.calls().len(), 2);
        assert!(session.is_online());
    }

    fn seed_reached(ledger: &CheckpointLedger, index: usize) {
        let event = EventContext::new("ev-1", "cat-1");
        let cp = &route()[index];
        ledger
            .insert_if_absent(&CheckpointCompletion::reached(&event, cp, Utc::now(), false))
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_drains_leftover_rows_when_starting_online() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        seed_reached(&ledger, 0);
        let api = Arc::new(ScriptedApi::new());
        let session = start_with(Arc::clone(&ledger), api.clone(), true).await;
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);

        let (pos_tx, pos_rx) = mpsc::channel(8);
        let (_net_tx, net_rx) = watch::channel(true);
        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.run(pos_rx, net_rx).await })
        };
        pos_tx.send(at_checkpoint(2, 50.0, 1.0)).await.unwrap();
        drop(pos_tx);
        runner.await.unwrap();
        session.settle().await;

        assert_eq!(api.calls_for("1"), 1);
        assert_eq!(ledger.count_unsynced().unwrap(), 0);
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(session.sync_stats().remote_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_drain_retries_failed_rows() {
        let ledger = Arc::new(CheckpointLedger::open_in_memory().unwrap());
        seed_reached(&ledger, 0);
        let api = Arc::new(ScriptedApi::new());
        api.fail_checkpoint("1");
        let options = SessionOptions {
            request_timeout: Duration::from_millis(500),
            drain_interval: Some(Duration::from_secs(30)),
            ..SessionOptions::default()
        };
        let session = TrackingSession::start(
            EventContext::new("ev-1", "cat-1"),
            route(),
            Arc::clone(&ledger),
            api.clone(),
            options,
        )
        .await
        .unwrap();

        let (pos_tx, pos_rx) = mpsc::channel::<PositionSample>(8);
        let (_net_tx, net_rx) = watch::channel(true);
        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.run(pos_rx, net_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.settle().await;
        let first = api.calls_for("1");
        assert!(first >= 1);
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);

        // Nothing else triggers a drain; only the timer can retry
        tokio::time::sleep(Duration::from_secs(30)).await;
        session.settle().await;
        let second = api.calls_for("1");
        assert!(second > first);
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Reached);

        api.heal_checkpoint("1");
        tokio::time::sleep(Duration::from_secs(30)).await;
        session.settle().await;
        assert_eq!(session.status("1").unwrap(), CompletionStatus::Synced);
        assert_eq!(ledger.count_unsynced().unwrap(), 0);

        // Synced rows are not sent again on later ticks
        let settled = api.calls_for("1");
        tokio::time::sleep(Duration::from_secs(90)).await;
        session.settle().await;
        assert_eq!(api.calls_for("1"), settled);

        drop(pos_tx);
        runner.await.unwrap();
    }
}
