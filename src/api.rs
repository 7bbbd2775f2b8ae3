use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tower_http::cors::CorsLayer;

use crate::error::MonitorError;
use crate::monitor::Monitor;
use crate::types::{AvailableMachine, MachineId, Session};

const SNAPSHOT_PUSH_INTERVAL: Duration = Duration::from_secs(1);

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            MonitorError::UnknownMachine(_) => (StatusCode::NOT_FOUND, "Machine not found".to_string()),
            MonitorError::InvalidConfig(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            other => {
                log::error!("request failed: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, MonitorError>;

#[derive(Debug, Default, Deserialize)]
pub struct DaysQuery {
    pub days: Option<u32>,
}

impl DaysQuery {
    fn checked(&self) -> Result<Option<u32>, MonitorError> {
        match self.days {
            Some(0) => Err(MonitorError::InvalidConfig("days must be at least 1".to_string())),
            days => Ok(days),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub days: Option<u32>,
}

#[derive(Serialize)]
struct AvailableResponse {
    count: usize,
    machines: Vec<AvailableMachine>,
}

#[derive(Serialize)]
struct HistoryResponse {
    machine_id: MachineId,
    #[serde(skip_serializing_if = "Option::is_none")]
    days: Option<u32>,
    sessions: Vec<Session>,
}

#[derive(Serialize)]
struct ControlResponse {
    changed: bool,
    running: bool,
}

pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/api/machines", get(machines_handler))
        .route("/api/machines/available", get(available_handler))
        .route("/api/machines/:id", get(machine_handler))
        .route("/api/machines/:id/history", get(history_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/usage", get(usage_handler))
        .route("/api/best-times", get(best_times_handler))
        .route("/api/availability", get(availability_handler))
        .route("/api/monitoring/start", post(start_handler))
        .route("/api/monitoring/stop", post(stop_handler))
        .route("/api/monitoring/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(monitor)
}

async fn machines_handler(State(monitor): State<Arc<Monitor>>) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_snapshot()?))
}

async fn available_handler(State(monitor): State<Arc<Monitor>>) -> ApiResult<impl Serialize> {
    let machines = monitor.get_available()?;
    Ok(Json(AvailableResponse {
        count: machines.len(),
        machines,
    }))
}

async fn machine_handler(State(monitor): State<Arc<Monitor>>, Path(id): Path<MachineId>) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_machine(id)?))
}

/// `limit` alone reads the retained history directly. With `days` (or with
/// neither) sessions are filtered to the window first, then cut to `limit`.
async fn history_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(id): Path<MachineId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl Serialize> {
    if let (Some(limit), None) = (query.limit, query.days) {
        let sessions = monitor.get_history(id, limit)?;
        return Ok(Json(HistoryResponse {
            machine_id: id,
            days: None,
            sessions,
        }));
    }
    let days = DaysQuery { days: query.days }
        .checked()?
        .unwrap_or(monitor.config().analytics_window_days);
    let mut sessions = monitor.get_history_window(id, Some(days))?;
    if let Some(limit) = query.limit {
        sessions.truncate(limit);
    }
    Ok(Json(HistoryResponse {
        machine_id: id,
        days: Some(days),
        sessions,
    }))
}

async fn statistics_handler(State(monitor): State<Arc<Monitor>>) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_stats()?))
}

async fn usage_handler(State(monitor): State<Arc<Monitor>>, Query(query): Query<DaysQuery>) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_usage_statistics(query.checked()?)?))
}

async fn best_times_handler(
    State(monitor): State<Arc<Monitor>>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_best_times(query.checked()?)?))
}

async fn availability_handler(
    State(monitor): State<Arc<Monitor>>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<impl Serialize> {
    Ok(Json(monitor.get_availability(query.checked()?)?))
}

async fn start_handler(State(monitor): State<Arc<Monitor>>) -> ApiResult<impl Serialize> {
    let changed = monitor.start_ingestion().await?;
    Ok(Json(ControlResponse { changed, running: true }))
}

async fn stop_handler(State(monitor): State<Arc<Monitor>>) -> ApiResult<impl Serialize> {
    let changed = monitor.stop_ingestion().await?;
    Ok(Json(ControlResponse { changed, running: false }))
}

async fn status_handler(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    Json(monitor.ingestion_status().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, monitor))
}

/// One `/ws` frame: the current snapshot as JSON text.
fn snapshot_message(monitor: &Monitor) -> anyhow::Result<Message> {
    let snapshot = monitor.get_snapshot()?;
    Ok(Message::Text(serde_json::to_string(&snapshot)?))
}

async fn handle_socket(mut socket: WebSocket, monitor: Arc<Monitor>) {
    let mut ticker = interval(SNAPSHOT_PUSH_INTERVAL);
    loop {
        ticker.tick().await;

        let message = match snapshot_message(&monitor) {
            Ok(message) => message,
            Err(e) => {
                log::error!("failed to build snapshot frame: {e}");
                break;
            }
        };
        if socket.send(message).await.is_err() {
            // Client disconnected
            break;
        }
    }
}
