//! Pilot Relay Server
//!
//! Run with: cargo run -- --config relay.toml
//!
//! Settings come from the config file (or the default locations) and
//! `PILOT_RELAY_*` environment variables. `RUST_LOG` overrides the
//! configured log level.

use clap::Parser;
use pilot_relay::api::{serve, AppState};
use pilot_relay::auth::JwtValidator;
use pilot_relay::config::{generate_default_config, Config, LoggingConfig, DEFAULT_JWT_SECRET};
use pilot_relay::websocket::ConnectionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pilot-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket signaling relay for teleoperation clients")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);
    config.validate()?;

    tracing::info!("Starting pilot relay v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.jwt_secret == DEFAULT_JWT_SECRET {
        tracing::warn!("Using the default JWT secret; set PILOT_RELAY_JWT_SECRET");
    }

    let whitelist = config.whitelist()?;
    if whitelist.is_enabled() {
        let networks: Vec<String> = whitelist.networks().iter().map(|n| n.to_string()).collect();
        tracing::info!(networks = ?networks, "IP whitelist enabled");
    } else {
        tracing::info!("IP whitelist disabled");
    }

    let gate = config.gate_config();
    tracing::info!(
        handshake_timeout_ms = config.relay.handshake_timeout_ms,
        max_message_size = config.relay.max_message_size,
        "Relay settings loaded"
    );

    let serve_config = config.serve_config();
    let state = AppState::new(
        ConnectionRegistry::new(),
        Arc::new(JwtValidator::new(&config.auth.jwt_secret)),
        whitelist,
        gate,
        serve_config.clone(),
    );

    serve(state, &serve_config).await?;

    tracing::info!("Pilot relay stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("pilot_relay={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
