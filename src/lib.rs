//! Geofenced checkpoint tracking with an offline-first completion ledger.

pub mod checkpoint_state;
pub mod completion;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod geo;
pub mod geofence;
pub mod ledger;
pub mod live_status;
pub mod remote;
pub mod replay;
pub mod session;
pub mod speed;
pub mod sync;
pub mod types;

pub use config::TrackerConfig;
pub use error::{TResult, TrackerError};
pub use ledger::CheckpointLedger;
pub use remote::{CompletionApi, EventConfigClient, HttpCompletionApi, RemoteError};
pub use session::{SessionOptions, TrackerEvent, TrackingSession, TrackingSnapshot};
pub use types::{
    Checkpoint, CheckpointCompletion, CompletionKey, CompletionStatus, EventContext,
    PositionSample,
};
