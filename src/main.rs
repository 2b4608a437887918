use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

use trail_tracker_rs::dashboard;
use trail_tracker_rs::live_status::{self, LiveStatus};
use trail_tracker_rs::remote::{parse_checkpoint_list, parse_speed_limit};
use trail_tracker_rs::replay::{self, Pacing, ReplaySummary, ReplayTrack};
use trail_tracker_rs::sync::SyncStats;
use trail_tracker_rs::types::{normalize_checkpoints, IngestRejection};
use trail_tracker_rs::{
    Checkpoint, CheckpointLedger, EventConfigClient, EventContext, HttpCompletionApi,
    SessionOptions, TrackerConfig, TrackerEvent, TrackingSession,
};

const POSITION_QUEUE: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "trail_tracker")]
#[command(about = "Replay a position track through the checkpoint tracker", long_about = None)]
struct Args {
    /// Event to track
    #[arg(long)]
    event_id: String,

    /// Category within the event
    #[arg(long)]
    category_id: String,

    /// JSON-lines track of position and connectivity records
    #[arg(long)]
    track: PathBuf,

    /// Tracker config (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint list (JSON); fetched from the event API when omitted
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Speed limit override in km/h
    #[arg(long)]
    speed_limit: Option<f64>,

    /// Pace the replay by sample timestamps
    #[arg(long)]
    realtime: bool,

    /// Playback speed multiplier for --realtime
    #[arg(long, default_value = "1.0")]
    speedup: f64,

    /// Start with connectivity down
    #[arg(long)]
    start_offline: bool,

    /// Forget this event's ledger rows before starting
    #[arg(long)]
    reset: bool,

    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Directory for the final summary and status files
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunSummary {
    event_id: String,
    category_id: String,
    checkpoints_total: usize,
    checkpoints_completed: usize,
    pending_sync: usize,
    event_complete: bool,
    violation_count: u64,
    replay_positions: usize,
    replay_rejected: usize,
    replay_skipped_lines: usize,
    sync: SyncStats,
    elapsed_secs: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let started = Instant::now();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(path) = &args.ledger {
        config.ledger_path = path.clone();
    }
    if let Some(limit) = args.speed_limit {
        config.speed_limit_override_kmh = Some(limit);
    }
    if let Some(port) = args.dashboard_port {
        config.dashboard_port = Some(port);
    }
    config.validate()?;
    if args.realtime && !(args.speedup.is_finite() && args.speedup > 0.0) {
        bail!("--speedup must be a positive number, got {}", args.speedup);
    }

    let event = EventContext::new(args.event_id.clone(), args.category_id.clone());
    println!("[{}] Trail Tracker starting", ts_now());
    println!("  Event: {} / category {}", event.event_id, event.category_id);
    println!("  Ledger: {}", config.ledger_path.display());
    println!("  Track: {}", args.track.display());

    let ledger = Arc::new(CheckpointLedger::open(&config.ledger_path)?);
    if args.reset {
        let removed = ledger.clear_event(&event.event_id)?;
        println!("[{}] Reset: removed {} ledger rows", ts_now(), removed);
    }

    let (checkpoints, rejected, event_limit) = load_checkpoints(&args, &config, &event).await?;
    for rejection in &rejected {
        log::warn!(
            "Checkpoint #{} ({}) rejected: {}",
            rejection.index,
            rejection.checkpoint_id.as_deref().unwrap_or("?"),
            rejection.reason
        );
    }
    if checkpoints.is_empty() {
        bail!("no usable checkpoints for event {}", event.event_id);
    }
    println!("[{}] Loaded {} checkpoints ({} rejected)", ts_now(), checkpoints.len(), rejected.len());

    let track = ReplayTrack::load(&args.track)
        .with_context(|| format!("reading track {}", args.track.display()))?;
    println!(
        "[{}] Track: {} records ({} positions, {} bad lines)",
        ts_now(),
        track.records.len(),
        track.position_count(),
        track.skipped_lines.len()
    );

    let api = Arc::new(HttpCompletionApi::new(
        config.api_base_url.clone(),
        config.api_token.clone(),
        config.request_timeout(),
    )?);
    let mut options = SessionOptions::from_config(&config, event_limit);
    options.initially_online = !args.start_offline;
    println!("  Speed limit: {:.0} km/h", options.speed_limit_kmh);

    let session =
        TrackingSession::start(event.clone(), checkpoints, Arc::clone(&ledger), api, options)
            .await?;

    let announcer = tokio::spawn(announce(session.subscribe()));
    let status_writer = config.status_path.clone().map(|path| {
        tokio::spawn(live_status::run_status_writer(
            session.clone(),
            path,
            Duration::from_secs_f64(config.status_interval_secs),
        ))
    });
    let dashboard_task = config.dashboard_port.map(|port| {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard(session, port).await {
                log::error!("Dashboard stopped: {}", e);
            }
        })
    });

    let (pos_tx, pos_rx) = mpsc::channel(POSITION_QUEUE);
    let (net_tx, net_rx) = watch::channel(!args.start_offline);
    let runner = {
        let session = session.clone();
        tokio::spawn(async move { session.run(pos_rx, net_rx).await })
    };

    let pacing = if args.realtime {
        Pacing::Realtime { speedup: args.speedup }
    } else {
        Pacing::AsFastAsPossible
    };
    let skipped_lines = track.skipped_lines.len();
    let replayed: ReplaySummary = replay::feed(track.records, pos_tx, net_tx, pacing).await;
    runner.await.context("session loop")?;
    session.settle().await;

    if session.is_online() {
        let report = session.drain_now().await?;
        if !report.is_clean() {
            println!(
                "[{}] Final drain: {} synced, {} still failing",
                ts_now(),
                report.synced.len(),
                report.failed.len()
            );
        }
        session.settle().await;
    }

    let snapshot = session.snapshot();
    let summary = RunSummary {
        event_id: snapshot.event_id.clone(),
        category_id: snapshot.category_id.clone(),
        checkpoints_total: snapshot.total,
        checkpoints_completed: snapshot.completed,
        pending_sync: snapshot.pending_sync,
        event_complete: snapshot.event_complete,
        violation_count: snapshot.violation_count,
        replay_positions: replayed.positions_sent,
        replay_rejected: replayed.positions_rejected,
        replay_skipped_lines: skipped_lines,
        sync: session.sync_stats(),
        elapsed_secs: started.elapsed().as_secs_f64(),
    };

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        let filename = dir.join(format!("trail_{}_{}.json", event.event_id, ts_now_clean()));
        std::fs::write(&filename, serde_json::to_string_pretty(&summary)?)?;
        LiveStatus::from_snapshot(&snapshot, started.elapsed())
            .save(&dir.join("live_status_final.json"))?;
        println!("[{}] Summary written to {}", ts_now(), filename.display());
    }

    session.shutdown();
    announcer.abort();
    if let Some(task) = status_writer {
        task.abort();
    }
    if let Some(task) = dashboard_task {
        task.abort();
    }

    println!("\n=== Final Stats ===");
    println!("Checkpoints: {} of {}", summary.checkpoints_completed, summary.checkpoints_total);
    println!("Awaiting sync: {}", summary.pending_sync);
    println!("Event complete: {}", summary.event_complete);
    println!("Overspeed samples: {}", summary.violation_count);
    println!(
        "Remote calls: {} ({} ok, {} failed)",
        summary.sync.remote_calls, summary.sync.successes, summary.sync.failures
    );
    println!("Positions replayed: {} ({} rejected)", summary.replay_positions, summary.replay_rejected);

    Ok(())
}

async fn load_checkpoints(
    args: &Args,
    config: &TrackerConfig,
    event: &EventContext,
) -> Result<(Vec<Checkpoint>, Vec<IngestRejection>, Option<f64>)> {
    match &args.checkpoints {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading checkpoints {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let limit = parse_speed_limit(&value);
            let raw = parse_checkpoint_list(value)?;
            let (checkpoints, rejected) = normalize_checkpoints(&raw, event);
            Ok((checkpoints, rejected, limit))
        }
        None => {
            println!("[{}] Fetching checkpoints from {}", ts_now(), config.api_base_url);
            let client = EventConfigClient::new(
                config.api_base_url.clone(),
                config.api_token.clone(),
                config.request_timeout(),
            )?;
            let fetched = client.fetch(event).await?;
            Ok((fetched.checkpoints, fetched.rejected, fetched.speed_limit_kmh))
        }
    }
}

async fn announce(mut events: broadcast::Receiver<TrackerEvent>) {
    loop {
        match events.recv().await {
            Ok(TrackerEvent::CheckpointReached { name, completed, total, over_speed, .. }) => {
                let flag = if over_speed { " (over speed)" } else { "" };
                println!("[{}] {} reached, {} of {} checkpoints{}", ts_now(), name, completed, total, flag);
            }
            Ok(TrackerEvent::EventComplete { total, .. }) => {
                println!("[{}] All {} checkpoints complete!", ts_now(), total);
            }
            Ok(TrackerEvent::OverspeedRaised { speed_kmh, limit_kmh }) => {
                println!("[{}] Slow down: {:.0} km/h, limit {:.0}", ts_now(), speed_kmh, limit_kmh);
            }
            Ok(TrackerEvent::ConnectivityChanged { online }) => {
                println!("[{}] {}", ts_now(), if online { "Back online" } else { "Offline" });
            }
            Ok(TrackerEvent::StorageFailure { checkpoint_id, message }) => {
                println!("[{}] Could not save checkpoint {}: {}", ts_now(), checkpoint_id, message);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
