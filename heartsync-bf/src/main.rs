//! heartsync-bf - Biofeedback microservice
//!
//! Serves the browser experiment: hands out session ids, receives webcam
//! frames, and answers long-polls with the next song to play.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use heartsync_common::config::{default_config_path, load_toml_or_default, RootFolderResolver};
use heartsync_common::events::EventBus;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use heartsync_bf::checkpoint::create_initial_checkpoint_pool;
use heartsync_bf::config::{ServiceConfig, MODULE_NAME};
use heartsync_bf::session::SessionRegistry;
use heartsync_bf::AppState;

/// Command-line arguments for heartsync-bf
#[derive(Parser, Debug)]
#[command(name = "heartsync-bf")]
#[command(about = "Heart-rate biofeedback music service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "HEARTSYNC_PORT")]
    port: Option<u16>,

    /// Root folder holding songs and session logs
    #[arg(short, long, env = "HEARTSYNC_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Configuration file (default: <config dir>/heartsync/heartsync-bf.toml)
    #[arg(short, long, env = "HEARTSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| default_config_path(MODULE_NAME));
    let mut config: ServiceConfig =
        load_toml_or_default(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config).context("Failed to initialize logging")?;

    info!(
        "Starting {} v{} ({} built {}, {})",
        MODULE_NAME,
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &config_path {
        Some(path) if path.exists() => info!("Configuration: {}", path.display()),
        _ => warn!("No configuration file found, using defaults"),
    }

    // Step 1: Resolve root folder
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder)
        .with_config_path(config_path)
        .resolve();
    let logs_directory = ServiceConfig::logs_directory(&root_folder);
    std::fs::create_dir_all(&logs_directory)
        .with_context(|| format!("Failed to create {}", logs_directory.display()))?;
    info!("Root folder: {}", root_folder.display());
    info!("Songs: {}", config.song_directory(&root_folder).display());

    // Step 2: Seed the checkpoint pool from earlier sessions
    let checkpoints = Arc::new(
        create_initial_checkpoint_pool(&logs_directory)
            .context("Failed to scan existing checkpoints")?,
    );

    // Step 3: Session registry and event bus
    let event_bus = EventBus::new(100);
    let registry = Arc::new(SessionRegistry::new(
        config.clone(),
        &root_folder,
        checkpoints,
        event_bus.clone(),
    ));

    let state = AppState::new(
        Arc::clone(&registry),
        event_bus,
        (config.estimator.frame_width, config.estimator.frame_height),
    );
    let app = heartsync_bf::build_router(state);

    // Step 4: Serve until a shutdown signal, then stop every session
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Workers send `end`, which releases pending /action requests
            shutdown_registry.shutdown().await;
        })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "heartsync_bf={level},heartsync_common={level},tower_http=info",
            level = level
        )
        .into()
    });

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
