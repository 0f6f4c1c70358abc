//! WebSocket Signaling Relay
//!
//! Connects teleoperation endpoints over persistent WebSocket connections
//! and forwards messages between them based on each endpoint's role.
//!
//! ## Architecture
//!
//! - **Handler**: admission gate (whitelist, credential, upgrade, handshake deadline)
//! - **Session**: one connection with its inbound and outbound pumps
//! - **ConnectionRegistry**: live sessions bucketed by role, single writer
//! - **ProtocolRouter**: handshake state machine and routing table
//! - **Messages**: wire shapes
//!
//! ## Handshake
//!
//! ```text
//! relay -> peer  {"type":"handshake_request","connection_id":"…","timestamp":…,
//!                 "supported_client_types":["web","video","control","telemetry"]}
//! peer  -> relay {"type":"handshake_response","connection_id":"…","client_type":"control"}
//! relay -> peer  {"type":"connection_established","client_type":"control",
//!                 "status":"connected","video_clients_available":false,"timestamp":…}
//! ```
//!
//! A session that has not completed the handshake within the configured
//! timeout is closed.

mod handler;
mod messages;
mod registry;
mod role;
mod router;
mod session;
mod whitelist;

pub use handler::{admit, extract_token, websocket_handler, ConnectParams, GateConfig};
pub use messages::{Envelope, Frame, HandshakeResponse, MessageKind, ServerMessage};
pub use registry::{ConnectionRegistry, RegistryError, RegistryStats};
pub use role::{DeclaredRole, Role};
pub use router::{route_for, ProtocolError, ProtocolRouter, Route};
pub use session::{SendError, Session, SessionConfig, SessionId};
pub use whitelist::{parse_client_ip, resolve_client_addr, Cidr, Whitelist, WhitelistError};
