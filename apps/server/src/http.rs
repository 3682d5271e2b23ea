//! Plain HTTP endpoints: health, stats, and ticket issuance.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use confab_session::UserId;
use serde_json::{json, Value};

use crate::state::AppState;

/// Header the fronting auth proxy sets after verifying the user. The OIDC
/// exchange itself happens upstream of this service.
const AUTH_SUBJECT_HEADER: &str = "x-authenticated-user";
const AUTH_NAME_HEADER: &str = "x-authenticated-name";

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "confab transcription server is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "active_sessions": state.manager.active_session_count().await,
        "websocket_connections": state.connections.load(Ordering::Relaxed),
        "active_tickets": state.tickets.active_count(Utc::now()),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sessions": { "active": state.manager.active_session_count().await },
        "websockets": { "connections": state.connections.load(Ordering::Relaxed) },
    }))
}

/// Mint a single-use socket-upgrade ticket for the authenticated caller.
pub async fn issue_ticket(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let subject = headers
        .get(AUTH_SUBJECT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|subject| !subject.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();
    let full_name = headers
        .get(AUTH_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(&subject)
        .to_string();

    let user_id = {
        let store = Arc::clone(&state.store);
        tokio::task::spawn_blocking(move || {
            store.upsert_user(UserId::generate(), &full_name, &subject)
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|error| {
            tracing::error!(%error, "user upsert failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
    };

    let now = Utc::now();
    let ticket = state.tickets.generate(user_id, addr.ip(), now);
    tracing::info!(user_id = %user_id, client_ip = %addr.ip(), "ticket issued");

    Ok(Json(json!({
        "ticket_id": ticket.ticket_id,
        "expires_in": ticket.expires_in(now),
    })))
}
