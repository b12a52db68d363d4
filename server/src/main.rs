//! ProjectPB realtime gateway - Main entry point.
//!
//! This binary starts the realtime server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT); open sockets are closed
//!   with code 1001 before the background tasks stop
//! - Background bridge link and idle-connection reaper
//!
//! # Configuration
//!
//! See [`pb_realtime::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Single node, in-process channel
//! PB_JWT_SECRET="$(openssl rand -hex 32)" \
//! PB_ADMIN_PASSWORD="change-me-please" \
//! cargo run --bin pb-realtime
//!
//! # Multiple nodes sharing Redis
//! PB_JWT_SECRET="..." \
//! PB_REDIS_URL="redis://127.0.0.1:6379" \
//! PORT=8081 \
//! cargo run --release --bin pb-realtime
//! ```

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pb_realtime::config::Config;
use pb_realtime::gateway::RealtimeHub;
use pb_realtime::routes::{create_router, AppState};

/// Time given to connection writers to send their close frames.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, code = err.code(), "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PB_JWT_SECRET            - HMAC secret for access tokens (32+ bytes)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                     - HTTP server port (default: 8080)");
            eprintln!("  PB_TOKEN_TTL_SECS        - Token lifetime (default: 86400)");
            eprintln!("  PB_REDIS_URL             - Shared channel; in-process if unset");
            eprintln!("  PB_BRIDGE_PREFIX         - Channel name prefix (default: rt:)");
            eprintln!("  PB_PUBLISH_TIMEOUT_MS    - Publish timeout (default: 2000)");
            eprintln!("  PB_RECONNECT_INITIAL_MS  - First reconnect delay (default: 100)");
            eprintln!("  PB_RECONNECT_MAX_MS      - Reconnect delay cap (default: 10000)");
            eprintln!("  PB_ALLOW_ANONYMOUS       - Accept sockets without a token");
            eprintln!("  PB_IDLE_TIMEOUT_SECS     - Idle connection timeout (default: 60)");
            eprintln!("  PB_ADMIN_PASSWORD        - Seed an 'admin' account at startup");
            eprintln!("  RUST_LOG                 - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "Server failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let transport = if config.redis_url.is_some() { "redis" } else { "memory" };
    info!(
        port = config.port,
        transport,
        allow_anonymous = config.allow_anonymous,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Realtime server starting"
    );

    let port = config.port;
    let admin_password = config.admin_password.clone();
    let state = AppState::new(config).context("failed to set up shared channel")?;

    match admin_password {
        Some(password) => {
            let authenticator = state.authenticator.clone();
            tokio::task::spawn_blocking(move || authenticator.seed_admin(&password))
                .await
                .context("admin seeding task failed")?
                .context("failed to seed admin account")?;
        }
        None => warn!("PB_ADMIN_PASSWORD not set, no admin account seeded"),
    }

    let tasks = state.start_background_tasks();
    info!("Bridge link and idle reaper started");

    let hub = state.hub.clone();
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(port, address = %bind_addr, "Server listening");

    let shutdown_hub = hub.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.close_all();
        })
        .await;

    info!("Server shutting down gracefully");
    close_connections(&hub).await;
    tasks.shutdown();

    served.context("server error")
}

/// Closes sockets that registered after the signal, then waits for every
/// writer to flush its 1001 close.
async fn close_connections(hub: &RealtimeHub) {
    hub.close_all();
    tokio::time::sleep(CLOSE_GRACE).await;
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
