//! Protocol Router
//!
//! Interprets the `type` of every inbound frame, runs the handshake that
//! promotes a pending session to its declared role, and forwards everything
//! else according to a fixed role-based table. Forwarded frames are relayed
//! byte-for-byte; only handshake, ping and status frames are parsed further.

use std::sync::Arc;
use thiserror::Error;

use super::messages::{Envelope, Frame, HandshakeResponse, MessageKind, PingMessage, ServerMessage};
use super::registry::{ConnectionRegistry, RegistryError};
use super::role::Role;
use super::session::{SendError, Session};

/// Problems with a frame; logged and dropped, never reported to the peer
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedEnvelope(String),

    #[error("Connection id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: String, got: String },

    #[error("Invalid client type in handshake")]
    InvalidRole,

    #[error("Handshake rejected: {0}")]
    Registry(#[from] RegistryError),
}

/// What to do with one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Validate as a handshake response
    Handshake,
    /// Answer the sender with `pong`
    ReplyPong,
    /// Answer the sender with registry stats
    ReplyStatus,
    /// Relay verbatim to every session in a role
    Broadcast(Role),
    /// Relay verbatim to every session but the sender
    BroadcastAll,
    /// Recognized, nothing to forward
    Ignore,
    /// Sender's role may not send this type
    Drop,
}

/// The routing table
pub fn route_for(kind: MessageKind, sender: Role) -> Route {
    use MessageKind as K;

    match kind {
        K::HandshakeResponse => Route::Handshake,
        K::Ping => Route::ReplyPong,
        K::GetStatus => Route::ReplyStatus,
        K::Pong | K::LegacyIdentify => Route::Ignore,
        K::ControlCommand if sender == Role::Web => Route::Broadcast(Role::Control),
        K::ControlResponse if sender == Role::Control => Route::Broadcast(Role::Web),
        K::ControlCommand | K::ControlResponse => Route::Drop,
        K::Offer | K::Answer | K::IceCandidate => match sender {
            Role::Web => Route::Broadcast(Role::Video),
            Role::Video => Route::Broadcast(Role::Web),
            _ => Route::Drop,
        },
        K::VideoClientReady | K::WebrtcConnected => Route::Broadcast(Role::Web),
        K::EmergencyStop | K::EmergencyStopReset => Route::Broadcast(Role::Control),
        K::RouteUpdate | K::LocationUpdate => Route::Broadcast(Role::Web),
        K::Other => Route::BroadcastAll,
    }
}

/// Routes frames between sessions held in the registry
pub struct ProtocolRouter {
    registry: ConnectionRegistry,
}

impl ProtocolRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Handle one raw frame received from `sender`
    pub async fn route(&self, sender: &Arc<Session>, raw: &str) {
        let envelope = match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = ProtocolError::MalformedEnvelope(e.to_string());
                tracing::debug!(session_id = sender.id(), error = %error, "Dropping frame");
                return;
            }
        };

        let Some(sender_role) = self.registry.role_of(sender.id()).await else {
            // Unregistered while the frame was in flight
            return;
        };

        tracing::debug!(
            session_id = sender.id(),
            msg_type = %envelope.kind,
            role = %sender_role,
            user = %sender.subject().name,
            "Message received"
        );

        let kind = MessageKind::parse(&envelope.kind);
        match route_for(kind, sender_role) {
            Route::Handshake => match self.handle_handshake(sender, raw).await {
                Ok(role) => {
                    tracing::info!(
                        session_id = sender.id(),
                        user = %sender.subject().name,
                        role = %role,
                        "Handshake completed"
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id = sender.id(), error = %e, "Handshake rejected");
                }
            },
            Route::ReplyPong => self.reply_pong(sender, raw),
            Route::ReplyStatus => {
                let stats = self.registry.stats().await;
                self.reply(sender, &ServerMessage::status_response(stats));
            }
            Route::Broadcast(role) => {
                let recipients = self.registry.broadcast(role, Frame::from(raw)).await;
                tracing::debug!(msg_type = %envelope.kind, to = %role, recipients, "Routed message");
            }
            Route::BroadcastAll => {
                let recipients = self
                    .registry
                    .broadcast_all(Frame::from(raw), Some(sender.id()))
                    .await;
                tracing::debug!(msg_type = %envelope.kind, recipients, "Unknown message type, broadcast to all");
            }
            Route::Ignore => {
                tracing::debug!(session_id = sender.id(), msg_type = %envelope.kind, "Message ignored");
            }
            Route::Drop => {
                tracing::debug!(
                    session_id = sender.id(),
                    msg_type = %envelope.kind,
                    role = %sender_role,
                    "Sender role not permitted for message type, dropped"
                );
            }
        }
    }

    /// Validate a handshake response and promote the session
    async fn handle_handshake(&self, session: &Arc<Session>, raw: &str) -> Result<Role, ProtocolError> {
        let response: HandshakeResponse = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

        if response.connection_id != session.correlation_id() {
            return Err(ProtocolError::CorrelationMismatch {
                expected: session.correlation_id().to_string(),
                got: response.connection_id,
            });
        }

        let role = response
            .client_type
            .assignable()
            .ok_or(ProtocolError::InvalidRole)?;

        self.registry.reassign_role(session.id(), role).await?;

        let video_available = self.registry.count(Role::Video).await > 0;
        self.reply(session, &ServerMessage::connection_established(role, video_available));

        if role == Role::Video {
            self.notify_video_ready().await;
        }

        Ok(role)
    }

    async fn notify_video_ready(&self) {
        match ServerMessage::video_client_ready().to_frame() {
            Ok(frame) => {
                let recipients = self.registry.broadcast(Role::Web, frame).await;
                tracing::info!(recipients, "Notified web clients that video is ready");
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode video ready notification"),
        }
    }

    fn reply_pong(&self, session: &Arc<Session>, raw: &str) {
        match serde_json::from_str::<PingMessage>(raw) {
            Ok(ping) => self.reply(
                session,
                &ServerMessage::Pong {
                    timestamp: ping.timestamp,
                },
            ),
            Err(e) => {
                tracing::debug!(session_id = session.id(), error = %e, "Malformed ping");
            }
        }
    }

    /// Queue a direct reply; a full queue disconnects the session
    fn reply(&self, session: &Arc<Session>, message: &ServerMessage) {
        match session.send_message(message) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                tracing::warn!(session_id = session.id(), "Outbound queue full on reply, disconnecting");
                self.registry.schedule_unregister(Arc::clone(session));
            }
            Err(e) => {
                tracing::debug!(session_id = session.id(), error = %e, "Reply not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Subject;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::Receiver;

    struct Peer {
        session: Arc<Session>,
        rx: Receiver<Frame>,
    }

    impl Peer {
        fn next_json(&mut self) -> Value {
            let frame = self.rx.try_recv().expect("expected a queued frame");
            serde_json::from_str(&frame).unwrap()
        }

        fn next_raw(&mut self) -> Frame {
            self.rx.try_recv().expect("expected a queued frame")
        }

        fn is_empty(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    async fn connect(router: &ProtocolRouter, role: Option<Role>) -> Peer {
        let (session, rx) = Session::new(
            Subject {
                id: 42,
                name: "pilot".to_string(),
            },
            16,
        );
        router.registry().register(Arc::clone(&session)).await.unwrap();
        if let Some(role) = role {
            router.registry().reassign_role(session.id(), role).await.unwrap();
        }
        Peer { session, rx }
    }

    fn handshake(session: &Session, client_type: &str) -> String {
        json!({
            "type": "handshake_response",
            "connection_id": session.correlation_id(),
            "client_type": client_type,
        })
        .to_string()
    }

    #[test]
    fn test_route_table() {
        use MessageKind as K;

        assert_eq!(route_for(K::ControlCommand, Role::Web), Route::Broadcast(Role::Control));
        assert_eq!(route_for(K::ControlCommand, Role::Control), Route::Drop);
        assert_eq!(route_for(K::ControlResponse, Role::Control), Route::Broadcast(Role::Web));
        assert_eq!(route_for(K::ControlResponse, Role::Web), Route::Drop);
        assert_eq!(route_for(K::Offer, Role::Web), Route::Broadcast(Role::Video));
        assert_eq!(route_for(K::Answer, Role::Video), Route::Broadcast(Role::Web));
        assert_eq!(route_for(K::IceCandidate, Role::Telemetry), Route::Drop);
        assert_eq!(route_for(K::IceCandidate, Role::Pending), Route::Drop);
        assert_eq!(route_for(K::WebrtcConnected, Role::Video), Route::Broadcast(Role::Web));
        assert_eq!(route_for(K::EmergencyStop, Role::Pending), Route::Broadcast(Role::Control));
        assert_eq!(route_for(K::EmergencyStopReset, Role::Web), Route::Broadcast(Role::Control));
        assert_eq!(route_for(K::LocationUpdate, Role::Telemetry), Route::Broadcast(Role::Web));
        assert_eq!(route_for(K::Ping, Role::Pending), Route::ReplyPong);
        assert_eq!(route_for(K::GetStatus, Role::Pending), Route::ReplyStatus);
        assert_eq!(route_for(K::LegacyIdentify, Role::Pending), Route::Ignore);
        assert_eq!(route_for(K::Other, Role::Control), Route::BroadcastAll);
    }

    #[tokio::test]
    async fn test_handshake_promotes_session() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut peer = connect(&router, None).await;

        router.route(&peer.session, &handshake(&peer.session, "control")).await;

        let ack = peer.next_json();
        assert_eq!(ack["type"], "connection_established");
        assert_eq!(ack["client_type"], "control");
        assert_eq!(ack["video_clients_available"], false);

        let stats = router.registry().stats().await;
        assert_eq!(stats.control, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_handshake_mismatch_keeps_pending() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut peer = connect(&router, None).await;

        let wrong = json!({
            "type": "handshake_response",
            "connection_id": "not-the-id",
            "client_type": "web",
        })
        .to_string();
        router.route(&peer.session, &wrong).await;

        assert!(peer.is_empty());
        assert_eq!(router.registry().role_of(peer.session.id()).await, Some(Role::Pending));

        // A retry with the right id still succeeds
        router.route(&peer.session, &handshake(&peer.session, "web")).await;
        assert_eq!(peer.next_json()["client_type"], "web");
    }

    #[tokio::test]
    async fn test_handshake_invalid_role_rejected() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut peer = connect(&router, None).await;

        router.route(&peer.session, &handshake(&peer.session, "pending")).await;
        router.route(&peer.session, &handshake(&peer.session, "robot")).await;

        assert!(peer.is_empty());
        assert!(!router.registry().is_handshake_complete(peer.session.id()).await);
    }

    #[tokio::test]
    async fn test_second_handshake_ignored() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut peer = connect(&router, None).await;

        router.route(&peer.session, &handshake(&peer.session, "web")).await;
        peer.next_json();
        router.route(&peer.session, &handshake(&peer.session, "control")).await;

        assert!(peer.is_empty());
        assert_eq!(router.registry().role_of(peer.session.id()).await, Some(Role::Web));
    }

    #[tokio::test]
    async fn test_video_handshake_notifies_web() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut web = connect(&router, Some(Role::Web)).await;
        let mut control = connect(&router, Some(Role::Control)).await;
        let mut video = connect(&router, None).await;

        router.route(&video.session, &handshake(&video.session, "video")).await;

        let ack = video.next_json();
        assert_eq!(ack["video_clients_available"], true);

        let note = web.next_json();
        assert_eq!(note["type"], "video_client_ready");
        assert_eq!(note["status"], "ready");
        assert!(control.is_empty());
    }

    #[tokio::test]
    async fn test_control_command_reaches_only_control() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let web = connect(&router, Some(Role::Web)).await;
        let mut control_a = connect(&router, Some(Role::Control)).await;
        let mut control_b = connect(&router, Some(Role::Control)).await;
        let mut video = connect(&router, Some(Role::Video)).await;

        let raw = r#"{"type":"control_command","data":{"linear":0.5,"angular":-0.1}}"#;
        router.route(&web.session, raw).await;

        assert_eq!(&*control_a.next_raw(), raw);
        assert_eq!(&*control_b.next_raw(), raw);
        assert!(video.is_empty());
    }

    #[tokio::test]
    async fn test_control_command_from_control_dropped() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let control = connect(&router, Some(Role::Control)).await;
        let mut other = connect(&router, Some(Role::Control)).await;
        let mut web = connect(&router, Some(Role::Web)).await;

        router
            .route(&control.session, r#"{"type":"control_command","data":{}}"#)
            .await;

        assert!(other.is_empty());
        assert!(web.is_empty());
    }

    #[tokio::test]
    async fn test_signaling_relays_to_opposite_bucket() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut web = connect(&router, Some(Role::Web)).await;
        let mut video = connect(&router, Some(Role::Video)).await;

        let offer = r#"{"type":"offer","data":{"sdp":"v=0"}}"#;
        router.route(&web.session, offer).await;
        assert_eq!(&*video.next_raw(), offer);
        assert!(web.is_empty());

        let answer = r#"{"type":"answer","data":{"sdp":"v=0"}}"#;
        router.route(&video.session, answer).await;
        assert_eq!(&*web.next_raw(), answer);
        assert!(video.is_empty());
    }

    #[tokio::test]
    async fn test_ping_gets_pong_with_timestamp() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut peer = connect(&router, None).await;

        router.route(&peer.session, r#"{"type":"ping","timestamp":12345}"#).await;

        let pong = peer.next_json();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 12345);
    }

    #[tokio::test]
    async fn test_get_status_reports_stats() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let _web = connect(&router, Some(Role::Web)).await;
        let _control = connect(&router, Some(Role::Control)).await;
        let mut peer = connect(&router, None).await;

        router.route(&peer.session, r#"{"type":"get_status"}"#).await;

        let reply = peer.next_json();
        assert_eq!(reply["type"], "status_response");
        assert_eq!(reply["stats"]["total"], 3);
        assert_eq!(reply["stats"]["web"], 1);
        assert_eq!(reply["stats"]["control"], 1);
        assert_eq!(reply["stats"]["pending"], 1);
        assert_eq!(reply["stats"]["video"], 0);
        assert_eq!(reply["stats"]["telemetry"], 0);
    }

    #[tokio::test]
    async fn test_unknown_type_broadcast_except_sender() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let mut sender = connect(&router, Some(Role::Telemetry)).await;
        let mut web = connect(&router, Some(Role::Web)).await;
        let mut pending = connect(&router, None).await;

        let raw = r#"{"type":"battery_level","data":{"percent":80}}"#;
        router.route(&sender.session, raw).await;

        assert_eq!(&*web.next_raw(), raw);
        assert_eq!(&*pending.next_raw(), raw);
        assert!(sender.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_ignored_frames_forward_nothing() {
        let router = ProtocolRouter::new(ConnectionRegistry::new());
        let sender = connect(&router, Some(Role::Web)).await;
        let mut other = connect(&router, Some(Role::Web)).await;

        router.route(&sender.session, "{not json").await;
        router.route(&sender.session, r#"{"data":1}"#).await;
        router.route(&sender.session, r#"{"type":"pong","timestamp":1}"#).await;
        router.route(&sender.session, r#"{"type":"control_client_connect"}"#).await;

        assert!(other.is_empty());
    }
}
