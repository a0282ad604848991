#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # codebroker
//!
//! Interactive code execution broker: accepts WebSocket connections, provisions
//! sandboxed PTY-attached containers, and streams bidirectional I/O between
//! clients and those containers for the life of a session.
//!
//! ## Subcommands
//!
//! - `codebroker serve` (default) — run the broker

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use codebroker::config::Config;
use codebroker::health_gate::HealthGate;
use codebroker::registry::SessionRegistry;
use codebroker::sandbox::docker::{DockerAdapter, ResourceLimits};
use codebroker::sandbox::SandboxAdapter;
use codebroker::state::HealthCache;
use codebroker::{routes, ws, AppState};

/// Interactive code execution broker.
#[derive(Parser)]
#[command(name = "codebroker", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => {
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("codebroker v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.listen);

    let adapter: Arc<dyn SandboxAdapter> = match DockerAdapter::connect(
        config.sandbox.docker_host.as_deref(),
        config.language_images(),
        ResourceLimits {
            #[allow(clippy::cast_possible_truncation)]
            cpu_nanos: (config.sandbox.cpu_limit * 1_000_000_000.0) as i64,
            memory_bytes: config.sandbox.memory_limit_bytes,
        },
    ) {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!("Failed to connect to sandbox runtime: {e:?}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        registry: SessionRegistry::new(config.registry_limits()),
        health_gate: Arc::new(HealthGate::new(config.backoff_policy())),
        health_cache: Arc::new(HealthCache::new(Duration::from_secs(
            config.health_cache_seconds,
        ))),
        connections: Arc::new(Mutex::new(HashSet::new())),
        start_time: Instant::now(),
        adapter,
        config: Arc::new(config),
    };

    let public_routes = Router::new().route("/health", get(routes::health::health));
    let ws_route = Router::new().route("/ws", get(ws::ws_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(public_routes)
        .merge(ws_route)
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&state.config.listen)
        .await
        .expect("Failed to bind");

    info!("Broker ready");

    // Periodic sweep: drive idle/lifetime-expired sessions through Stop, and
    // prune Health Gate state for connections that closed without running
    // their own disconnect cleanup. Each Session also runs its own watchdog
    // (§4.4); this pass exists for registry-wide bookkeeping and as a
    // backstop.
    let sweep_registry = Arc::clone(&state.registry);
    let sweep_health_gate = Arc::clone(&state.health_gate);
    let sweep_connections = Arc::clone(&state.connections);
    let sweep_interval = Duration::from_secs(state.config.sweep_interval_seconds);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_registry.sweep().await;
            let active = sweep_connections.lock().await.clone();
            sweep_health_gate.prune(&active);
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();

    let shutdown_wait = tokio::time::timeout(
        Duration::from_secs(10),
        state.registry.remove_all("server shutting down"),
    )
    .await;
    if shutdown_wait.is_err() {
        error!("Shutdown cleanup exceeded grace period, forcing exit");
    }

    info!("Goodbye");
}
