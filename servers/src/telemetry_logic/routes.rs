//! # HTTP Surface
//!
//! Routes of the relay:
//!
//! - `POST /api/ingest`: token, then signature over the raw body, then
//!   payload validation. Stored rows are broadcast one by one, in order, from
//!   a background task.
//! - `GET /api/events`: newest stored events, optionally for one agent.
//! - `POST /api/events/clear`: removes rows and tells viewers.
//! - `GET /ws`: viewer WebSocket, optionally filtered by agent.
//! - `GET /health`: liveness.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use lib_common::models::{ClearRequest, ControlMessage, EventRecord, IngestBatch};
use lib_common::retrieve::API_TOKEN_HEADER;
use lib_common::security::{SIGNATURE_HEADER, SIGNATURE_TS_HEADER};

use super::downstream::handle_socket;
use super::error::ApiError;
use super::state::AppState;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/events", get(events_handler))
        .route("/api/events/clear", post(clear_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match header(headers, API_TOKEN_HEADER) {
        Some(token) if state.token_matches(token) => Ok(()),
        _ => {
            tracing::warn!("rejected request with a missing or wrong api token");
            Err(ApiError::InvalidToken)
        }
    }
}

/// Accepts one signed batch.
///
/// Only rows the store returned are broadcast, and only after the insert
/// succeeded. The fan-out runs on its own task so a slow viewer never holds
/// up the response; within the task the rows still go out in order.
async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_token(&state, &headers)?;

    let (Some(timestamp), Some(signature)) = (
        header(&headers, SIGNATURE_TS_HEADER),
        header(&headers, SIGNATURE_HEADER),
    ) else {
        tracing::warn!("rejected ingest without signature headers");
        return Err(ApiError::Unauthorized);
    };

    if let Err(e) = state.validator.validate(timestamp, signature, &body) {
        tracing::warn!(reason = e.kind(), "rejected ingest: {}", e);
        return Err(ApiError::Unauthorized);
    }

    let batch = IngestBatch::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?;
    let agent_id = batch.agent_id.clone();

    let records = state.store.insert(batch.into_rows()).await?;
    let stored = records.len();

    let registry = state.registry.clone();
    tokio::spawn(async move {
        for record in records {
            registry.broadcast(record).await;
        }
    });

    tracing::debug!(agent = %agent_id, stored, "ingested batch");
    Ok(Json(json!({ "stored": stored })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    agent_id: Option<String>,
    limit: Option<u32>,
}

async fn events_handler(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let agent_id = query.agent_id.as_deref().filter(|a| !a.is_empty());

    let records = state.store.fetch(agent_id, limit).await?;
    Ok(Json(records))
}

async fn clear_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_token(&state, &headers)?;

    let request: ClearRequest = if body.is_empty() {
        ClearRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };

    // An empty agent id means every agent, as on the read side.
    let agent_id = request.agent_id.filter(|a| !a.is_empty());

    let cleared = state.store.remove(agent_id.as_deref()).await?;
    tracing::info!(agent = ?agent_id, cleared, "cleared events");

    state
        .registry
        .broadcast(ControlMessage::Clear { agent_id })
        .await;

    Ok(Json(json!({ "cleared": cleared })))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    agent_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let agent_filter = query.agent_id.filter(|a| !a.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, agent_filter))
}

async fn health_handler() -> &'static str {
    "OK"
}
