//! Remote event API: checkpoint completion and event configuration.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    normalize_checkpoints, Checkpoint, CheckpointCompletion, EventContext, IngestRejection,
    RawCheckpoint,
};

/// Remote call failures. Everything except `ClientSetup` is transient from
/// the tracker's view: the row stays unsynced and is retried on the next drain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The HTTP client could not be built (TLS backend, bad settings)
    #[error("HTTP client setup failed: {0}")]
    ClientSetup(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if let Some(status) = e.status() {
            RemoteError::HttpStatus(status.as_u16())
        } else if e.is_decode() {
            RemoteError::Parse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Payload of the "mark checkpoint complete" call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub event_id: String,
    pub category_id: String,
    pub checkpoint_id: String,
    pub arrived_at: DateTime<Utc>,
    pub over_speed: bool,
}

impl From<&CheckpointCompletion> for CompletionRequest {
    fn from(c: &CheckpointCompletion) -> Self {
        CompletionRequest {
            event_id: c.event_id.clone(),
            category_id: c.category_id.clone(),
            checkpoint_id: c.checkpoint_id.clone(),
            arrived_at: c.arrived_at,
            over_speed: c.over_speed,
        }
    }
}

/// Remote authority for checkpoint completions.
///
/// Implementations must be idempotent per (event_id, checkpoint_id): the
/// tracker may repeat a call after a timeout or a restart.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn mark_checkpoint_complete(&self, request: &CompletionRequest)
        -> Result<(), RemoteError>;
}

/// Generic `{ "success": bool, "message": ..., "data": ... }` envelope
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl ApiEnvelope {
    fn rejected(&self) -> bool {
        if self.success == Some(false) {
            return true;
        }
        matches!(self.status, Some(Value::Bool(false)))
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, RemoteError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| RemoteError::ClientSetup(e.to_string()))
}

const USER_AGENT: &str = concat!("trail-tracker/", env!("CARGO_PKG_VERSION"));

/// HTTP implementation of [`CompletionApi`]
pub struct HttpCompletionApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCompletionApi {
    pub const COMPLETE_PATH: &'static str = "/events/checkpoints/complete";

    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        Ok(HttpCompletionApi {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl CompletionApi for HttpCompletionApi {
    async fn mark_checkpoint_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<(), RemoteError> {
        let url = format!("{}{}", self.base_url, Self::COMPLETE_PATH);
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus(status.as_u16()));
        }

        // Empty or non-JSON 2xx bodies count as success
        let body = response.text().await?;
        if let Ok(envelope) = serde_json::from_str::<ApiEnvelope>(&body) {
            if envelope.rejected() {
                return Err(RemoteError::Rejected(
                    envelope.message.unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
        }
        Ok(())
    }
}

/// Event configuration fetched once at session start
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub checkpoints: Vec<Checkpoint>,
    pub rejected: Vec<IngestRejection>,
    pub speed_limit_kmh: Option<f64>,
}

/// Reads checkpoint lists and per-event settings from the event API
pub struct EventConfigClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl EventConfigClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        Ok(EventConfigClient {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus(status.as_u16()));
        }
        Ok(response.json::<Value>().await?)
    }

    pub async fn fetch(&self, event: &EventContext) -> Result<EventConfig, RemoteError> {
        let checkpoints_json = self
            .get_json(&format!("/events/checkpoints/{}", event.event_id))
            .await?;
        let raw = parse_checkpoint_list(checkpoints_json)?;
        let (checkpoints, rejected) = normalize_checkpoints(&raw, event);

        // The config endpoint is optional; a missing limit falls back to local config
        let speed_limit_kmh = match self
            .get_json(&format!("/events/config/{}", event.event_id))
            .await
        {
            Ok(v) => parse_speed_limit(&v),
            Err(e) => {
                log::warn!("Event config unavailable for {}: {}", event.event_id, e);
                None
            }
        };

        Ok(EventConfig {
            checkpoints,
            rejected,
            speed_limit_kmh,
        })
    }
}

/// Accepts a bare array or an envelope with the array under `data`
pub fn parse_checkpoint_list(value: Value) -> Result<Vec<RawCheckpoint>, RemoteError> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(_) => {
            let envelope: ApiEnvelope =
                serde_json::from_value(value).map_err(|e| RemoteError::Parse(e.to_string()))?;
            match envelope.data {
                Some(Value::Object(mut inner)) => inner
                    .remove("checkpoints")
                    .unwrap_or(Value::Array(Vec::new())),
                Some(data) => data,
                None => Value::Array(Vec::new()),
            }
        }
        other => {
            return Err(RemoteError::Parse(format!(
                "unexpected checkpoint payload: {}",
                other
            )))
        }
    };

    // Per-item parsing so one malformed entry cannot sink the list
    let items = match list {
        Value::Array(items) => items,
        other => {
            return Err(RemoteError::Parse(format!(
                "checkpoint list is not an array: {}",
                other
            )))
        }
    };
    Ok(items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .unwrap_or_else(|e| RawCheckpoint::unparseable(e.to_string()))
        })
        .collect())
}

/// Speed limit from values such as `60`, `"60"` or `"60 kmph"`
pub fn parse_speed_limit(value: &Value) -> Option<f64> {
    let field = value
        .get("data")
        .unwrap_or(value)
        .as_object()
        .and_then(|obj| {
            ["speed_limit", "speedLimit", "speed_limit_kmh"]
                .iter()
                .find_map(|k| obj.get(*k))
        })?;

    let limit = match field {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<f64>().ok()),
        _ => None,
    }?;
    (limit.is_finite() && limit > 0.0).then_some(limit)
}
