//! Application State
//!
//! Shared state accessible by all handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenValidator;
use crate::websocket::{ConnectionRegistry, GateConfig, ProtocolRouter, Whitelist};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Routes frames between sessions; owns the registry handle
    pub router: Arc<ProtocolRouter>,
    /// External credential check
    pub validator: Arc<dyn TokenValidator>,
    /// Network origin policy
    pub whitelist: Arc<Whitelist>,
    /// Handshake timeout and per-session transport settings
    pub gate: GateConfig,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create a new AppState around a running registry
    pub fn new(
        registry: ConnectionRegistry,
        validator: Arc<dyn TokenValidator>,
        whitelist: Whitelist,
        gate: GateConfig,
        config: ApiConfig,
    ) -> Self {
        Self {
            router: Arc::new(ProtocolRouter::new(registry)),
            validator,
            whitelist: Arc::new(whitelist),
            gate,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.router.registry()
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// CORS origins; `*` allows any
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
