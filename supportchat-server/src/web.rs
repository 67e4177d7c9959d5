//! WebSocket upgrade endpoints and REST API.
//!
//! `/ws` is the customer endpoint: the caller's session resolves (or
//! creates) their open chat before the upgrade, so failures still surface
//! as HTTP errors. Staff sessions are refused there. `/ws/staff` admits
//! staff sessions and binds them to no chat. The REST API covers the chat
//! lifecycle and history reads.

use std::sync::Arc;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::{self, Binding};
use crate::db::{ChatStatus, CloseOutcome};
use crate::error::ChatResult;
use crate::frame::MessageFrame;
use crate::identity::{CustomerIdentity, Identity, StaffIdentity};
use crate::lifecycle;
use crate::registry::RegistryStats;
use crate::server::SharedState;

/// Build the axum router with WebSocket and REST endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/ws", get(customer_upgrade))
        .route("/ws/staff", get(staff_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/chats", post(api_create_chat).get(api_open_chats))
        .route("/api/v1/chats/{id}/close", post(api_close_chat))
        .route("/api/v1/chats/{id}/messages", get(api_chat_history))
        .with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
}

// ── WebSocket handlers ─────────────────────────────────────────────────

async fn customer_upgrade(
    ws: WebSocketUpgrade,
    CustomerIdentity(identity): CustomerIdentity,
    State(state): State<Arc<SharedState>>,
) -> ChatResult<Response> {
    let chat = lifecycle::create_or_resume(&state, &identity.username)?;
    let binding = Binding::Customer { chat_id: chat.id };
    Ok(ws
        .on_upgrade(move |socket| connection::handle(socket, state, identity, binding))
        .into_response())
}

async fn staff_upgrade(
    ws: WebSocketUpgrade,
    StaffIdentity(identity): StaffIdentity,
    State(state): State<Arc<SharedState>>,
) -> Response {
    ws.on_upgrade(move |socket| connection::handle(socket, state, identity, Binding::Staff))
        .into_response()
}

// ── REST types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    connections: RegistryStats,
    uptime_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatIdResponse {
    chat_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    id: i64,
    owner: String,
    status: ChatStatus,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseResponse {
    chat_id: i64,
    status: ChatStatus,
    already_closed: bool,
}

// ── REST handlers ──────────────────────────────────────────────────────

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.registry.stats(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn api_create_chat(
    CustomerIdentity(identity): CustomerIdentity,
    State(state): State<Arc<SharedState>>,
) -> ChatResult<(StatusCode, Json<ChatIdResponse>)> {
    let chat = lifecycle::create_or_resume(&state, &identity.username)?;
    let status = if chat.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(ChatIdResponse { chat_id: chat.id })))
}

async fn api_open_chats(
    _staff: StaffIdentity,
    State(state): State<Arc<SharedState>>,
) -> ChatResult<Json<Vec<ChatResponse>>> {
    let chats = lifecycle::open_chats(&state)?
        .into_iter()
        .map(|c| ChatResponse { id: c.id, owner: c.owner, status: c.status, created_at: c.created_at })
        .collect();
    Ok(Json(chats))
}

async fn api_close_chat(
    Path(id): Path<i64>,
    identity: Identity,
    State(state): State<Arc<SharedState>>,
) -> ChatResult<Json<CloseResponse>> {
    let outcome = lifecycle::close(&state, id, &identity)?;
    Ok(Json(CloseResponse {
        chat_id: id,
        status: ChatStatus::Closed,
        already_closed: outcome == CloseOutcome::AlreadyClosed,
    }))
}

async fn api_chat_history(
    Path(id): Path<i64>,
    identity: Identity,
    State(state): State<Arc<SharedState>>,
) -> ChatResult<Json<Vec<MessageFrame>>> {
    let log = lifecycle::history(&state, id, &identity)?;
    Ok(Json(log.into_iter().map(MessageFrame::from).collect()))
}

/// Security headers middleware.
async fn security_headers(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    resp
}
