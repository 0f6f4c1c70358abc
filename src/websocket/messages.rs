//! WebSocket Message Types
//!
//! Wire shapes exchanged with relay peers. Every frame is a JSON object with
//! a `type` field. Payloads the relay only forwards are never deserialized
//! beyond that field.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::registry::RegistryStats;
use super::role::{DeclaredRole, Role};

/// One outbound text frame, shared between every recipient of a broadcast
pub type Frame = Arc<str>;

/// The minimal envelope every inbound frame must parse as
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Peer reply to `handshake_request`
///
/// Extra fields such as `auth_token` are ignored; credentials are checked
/// at upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeResponse {
    pub connection_id: String,
    pub client_type: DeclaredRole,
}

/// Application-level keepalive from a peer
#[derive(Debug, Clone, Deserialize)]
pub struct PingMessage {
    #[serde(default)]
    pub timestamp: serde_json::Value,
}

/// Messages originated by the relay itself
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection, asks the peer to identify itself
    HandshakeRequest {
        connection_id: String,
        timestamp: i64,
        supported_client_types: Vec<Role>,
    },
    /// Handshake accepted
    ConnectionEstablished {
        client_type: Role,
        status: String,
        video_clients_available: bool,
        timestamp: i64,
    },
    /// Reply to `get_status`
    StatusResponse { stats: RegistryStats, timestamp: i64 },
    /// Reply to `ping`, echoing the peer's timestamp
    Pong { timestamp: serde_json::Value },
    /// Sent to web sessions when a video session comes online
    VideoClientReady { status: String, timestamp: i64 },
}

impl ServerMessage {
    pub fn handshake_request(connection_id: &str) -> Self {
        Self::HandshakeRequest {
            connection_id: connection_id.to_string(),
            timestamp: unix_now(),
            supported_client_types: Role::ASSIGNABLE.to_vec(),
        }
    }

    pub fn connection_established(role: Role, video_clients_available: bool) -> Self {
        Self::ConnectionEstablished {
            client_type: role,
            status: "connected".to_string(),
            video_clients_available,
            timestamp: unix_now(),
        }
    }

    pub fn status_response(stats: RegistryStats) -> Self {
        Self::StatusResponse {
            stats,
            timestamp: unix_now(),
        }
    }

    pub fn video_client_ready() -> Self {
        Self::VideoClientReady {
            status: "ready".to_string(),
            timestamp: unix_now(),
        }
    }

    /// Serialize into a frame ready for a session queue
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// Message types the router knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    HandshakeResponse,
    Ping,
    Pong,
    ControlCommand,
    ControlResponse,
    Offer,
    Answer,
    IceCandidate,
    VideoClientReady,
    WebrtcConnected,
    EmergencyStop,
    EmergencyStopReset,
    RouteUpdate,
    LocationUpdate,
    GetStatus,
    /// Pre-handshake identification from old clients
    LegacyIdentify,
    /// Anything else
    Other,
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "handshake_response" => Self::HandshakeResponse,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "control_command" => Self::ControlCommand,
            "control_response" => Self::ControlResponse,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice-candidate" => Self::IceCandidate,
            "video_client_ready" => Self::VideoClientReady,
            "webrtc_connected" => Self::WebrtcConnected,
            "emergency_stop" => Self::EmergencyStop,
            "emergency_stop_reset" => Self::EmergencyStopReset,
            "route_update" => Self::RouteUpdate,
            "location_update" => Self::LocationUpdate,
            "get_status" => Self::GetStatus,
            "control_client_connect" | "video_client_connect" => Self::LegacyIdentify,
            _ => Self::Other,
        }
    }
}

/// Current time as Unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
