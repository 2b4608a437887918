use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{TResult, TrackerError};
use crate::session::{TrackerEvent, TrackingSession, TrackingSnapshot};
use crate::sync::DrainReport;

#[derive(Clone)]
pub struct DashboardState {
    session: TrackingSession,
}

/// Socket frames: full snapshots plus discrete notifications
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame<'a> {
    Snapshot { snapshot: &'a TrackingSnapshot },
    Event { event: &'a TrackerEvent },
}

#[derive(Debug, Deserialize)]
pub struct SpeedLimitUpdate {
    pub speed_limit_kmh: f64,
}

struct ApiError(TrackerError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TrackerError::UnknownCheckpoint(_) | TrackerError::UnknownCompletion { .. } => {
                StatusCode::NOT_FOUND
            }
            TrackerError::InvalidConfig(_)
            | TrackerError::InvalidCheckpoint(_)
            | TrackerError::InvalidPosition(_) => StatusCode::BAD_REQUEST,
            TrackerError::Remote(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        ApiError(e)
    }
}

pub fn router(session: TrackingSession) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .route("/checkpoints/:checkpoint_id/complete", post(complete_handler))
        .route("/speed-limit", put(speed_limit_handler))
        .route("/sync", post(sync_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(DashboardState { session })
}

pub async fn start_dashboard(session: TrackingSession, port: u16) -> TResult<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Dashboard listening on http://{}", addr);
    axum::serve(listener, router(session)).await?;
    Ok(())
}

async fn status_handler(State(state): State<DashboardState>) -> Json<TrackingSnapshot> {
    Json(state.session.snapshot())
}

async fn complete_handler(
    State(state): State<DashboardState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reached = state.session.force_mark_complete(&checkpoint_id)?;
    let status = state.session.status(&checkpoint_id)?;
    Ok(Json(json!({
        "checkpoint_id": checkpoint_id,
        "newly_reached": reached,
        "status": status,
    })))
}

async fn speed_limit_handler(
    State(state): State<DashboardState>,
    Json(update): Json<SpeedLimitUpdate>,
) -> Result<StatusCode, ApiError> {
    state.session.set_speed_limit(update.speed_limit_kmh)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_handler(State(state): State<DashboardState>) -> Result<Json<DrainReport>, ApiError> {
    Ok(Json(state.session.drain_now().await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.session))
}

async fn handle_socket(mut socket: WebSocket, session: TrackingSession) {
    let mut snapshots = session.watch_snapshot();
    let mut events = session.subscribe();

    let first = snapshots.borrow_and_update().clone();
    if send_frame(&mut socket, &Frame::Snapshot { snapshot: &first }).await.is_err() {
        return;
    }

    loop {
        let sent = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                send_frame(&mut socket, &Frame::Snapshot { snapshot: &snapshot }).await
            }
            event = events.recv() => match event {
                Ok(event) => send_frame(&mut socket, &Frame::Event { event: &event }).await,
                Err(RecvError::Lagged(n)) => {
                    log::debug!("Dashboard client lagged {} events", n);
                    Ok(())
                }
                Err(RecvError::Closed) => break,
            },
        };
        if sent.is_err() {
            // Client disconnected
            break;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame<'_>) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|e| {
        log::error!("Failed to encode dashboard frame: {}", e);
    })?;
    socket.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CheckpointLedger;
    use crate::remote::testing::ScriptedApi;
    use crate::session::SessionOptions;
    use crate::types::{test_checkpoint, CompletionStatus, EventContext};
    use std::sync::Arc;

    async fn state() -> DashboardState {
        let session = TrackingSession::start(
            EventContext::new("ev-1", "cat-1"),
            vec![test_checkpoint("1", 10.0, 10.0, None)],
            Arc::new(CheckpointLedger::open_in_memory().unwrap()),
            Arc::new(ScriptedApi::new()),
            SessionOptions {
                initially_online: false,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();
        DashboardState { session }
    }

    #[tokio::test]
    async fn test_manual_completion_endpoint() {
        let state = state().await;

        let Json(body) = complete_handler(State(state.clone()), Path("1".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(body["newly_reached"], true);
        assert_eq!(body["status"], "reached");

        let Json(body) = complete_handler(State(state.clone()), Path("1".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(body["newly_reached"], false);

        let err = complete_handler(State(state.clone()), Path("nope".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let Json(snapshot) = status_handler(State(state.clone())).await;
        assert_eq!(snapshot.completed, 1);
        assert_eq!(state.session.status("1").unwrap(), CompletionStatus::Reached);
    }

    #[tokio::test]
    async fn test_speed_limit_endpoint_validates() {
        let state = state().await;

        let ok = speed_limit_handler(
            State(state.clone()),
            Json(SpeedLimitUpdate { speed_limit_kmh: 80.0 }),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(ok, StatusCode::NO_CONTENT);
        assert_eq!(state.session.snapshot().speed_limit_kmh, 80.0);

        let err = speed_limit_handler(
            State(state.clone()),
            Json(SpeedLimitUpdate { speed_limit_kmh: -1.0 }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
