//! WebSocket Handler
//!
//! The admission gate. Checks the client's network origin and credential,
//! upgrades the connection, and starts a pending session with a handshake
//! deadline.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::messages::ServerMessage;
use super::router::ProtocolRouter;
use super::session::{Session, SessionConfig};
use super::whitelist::resolve_client_addr;
use crate::api::{ApiError, AppState};
use crate::auth::{AuthError, Subject};

/// Settings the gate applies to every admitted connection
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// How long a new session may stay pending
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Query string accepted on the upgrade endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
///
/// Rejects with 403 when the origin is not whitelisted and 401 when the
/// credential is missing or invalid; no session exists in either case.
pub async fn websocket_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let client_addr = resolve_client_addr(&headers, peer);
    tracing::info!(addr = %client_addr, "Connection attempt");

    if !state.whitelist.is_allowed(&client_addr) {
        tracing::warn!(addr = %client_addr, "Address blocked by whitelist");
        return Err(ApiError::Authorization("Access denied".to_string()));
    }

    let token = extract_token(params.token.as_deref(), &headers).ok_or_else(|| {
        tracing::warn!(addr = %client_addr, "Missing auth token");
        ApiError::Authentication(AuthError::MissingToken.to_string())
    })?;

    let subject = state.validator.validate(&token).await.map_err(|e| {
        tracing::warn!(addr = %client_addr, error = %e, "Invalid auth token");
        ApiError::Authentication("Invalid authentication token".to_string())
    })?;

    tracing::info!(
        user = %subject.name,
        user_id = subject.id,
        addr = %client_addr,
        "Authentication successful"
    );

    let ws = ws.ok_or(ApiError::UpgradeRequired)?;
    let router = Arc::clone(&state.router);
    let gate = state.gate.clone();
    let limit = gate.session.max_message_size;

    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| admit(socket, subject, router, gate)))
}

/// Token from the `token` query parameter, else the Authorization header
pub fn extract_token(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Run an upgraded connection as a pending session
pub async fn admit(socket: WebSocket, subject: Subject, router: Arc<ProtocolRouter>, gate: GateConfig) {
    let (session, outbound) = Session::new(subject, gate.session.send_queue_capacity);
    let registry = router.registry().clone();

    if let Err(e) = registry.register(Arc::clone(&session)).await {
        tracing::error!(error = %e, "Failed to register session");
        return;
    }

    let request = ServerMessage::handshake_request(session.correlation_id());
    if let Err(e) = session.send_message(&request) {
        tracing::warn!(session_id = session.id(), error = %e, "Failed to send handshake request");
        registry.unregister(&session).await;
        return;
    }

    tracing::info!(
        session_id = session.id(),
        user = %session.subject().name,
        connection_id = %session.correlation_id(),
        "Handshake request sent"
    );

    let session_id = session.id();
    let timeout = gate.handshake_timeout;
    let timer_registry = registry.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if timer_registry.expire_handshake(session_id).await {
            tracing::warn!(session_id, ?timeout, "Handshake timeout");
        }
    });

    session.run(socket, outbound, router, gate.session).await;
}
