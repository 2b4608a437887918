use thiserror::Error;

use crate::remote::RemoteError;

/// Checkpoint tracker error types
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("No completion recorded for checkpoint {checkpoint_id} in event {event_id}")]
    UnknownCompletion {
        event_id: String,
        checkpoint_id: String,
    },

    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    #[error("Invalid checkpoint data: {0}")]
    InvalidCheckpoint(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Storage failures threaten durability and must reach the caller
    pub fn is_storage(&self) -> bool {
        matches!(self, TrackerError::Storage(_))
    }
}

/// Result type for tracker operations
pub type TResult<T> = Result<T, TrackerError>;
