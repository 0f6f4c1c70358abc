//! # Pilot Relay
//!
//! WebSocket signaling relay for teleoperation. Browser dashboards, video
//! clients, control clients and telemetry agents connect to one endpoint,
//! declare a role in a short handshake, and the relay forwards messages
//! between roles.
//!
//! ## Modules
//!
//! - [`websocket`]: Registry, sessions, routing and the admission gate
//! - [`auth`]: Bearer token validation
//! - [`api`]: HTTP server with Axum
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pilot_relay::api::{serve, AppState};
//! use pilot_relay::auth::JwtValidator;
//! use pilot_relay::config::Config;
//! use pilot_relay::websocket::ConnectionRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     config.validate()?;
//!
//!     let serve_config = config.serve_config();
//!     let state = AppState::new(
//!         ConnectionRegistry::new(),
//!         Arc::new(JwtValidator::new(&config.auth.jwt_secret)),
//!         config.whitelist()?,
//!         config.gate_config(),
//!         serve_config.clone(),
//!     );
//!
//!     serve(state, &serve_config).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod websocket;

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use auth::{AuthError, Claims, JwtValidator, Subject, TokenValidator};

pub use config::{Config, ConfigError, LoggingConfig};

pub use websocket::{
    websocket_handler, ConnectionRegistry, GateConfig, ProtocolRouter, RegistryStats, Role,
    ServerMessage, Session, SessionConfig, Whitelist,
};
