//! Picam receiver service entry point.
//!
//! Loads configuration, opens the configured persistence backend, binds the
//! listening socket and runs until SIGINT/SIGTERM.
//!
//! # Configuration
//!
//! Configuration is loaded from, in order:
//! 1. An explicit file given as the first argument, or `config/receiver.toml`
//!    and `/etc/picam/receiver.toml`
//! 2. Environment variables prefixed with `RECEIVER__`
//!
//! See `config.rs` for the available options.

use anyhow::{bail, Context, Result};
use picam_receiver::config::{BackendKind, LoggingConfig, ReceiverConfig};
use picam_receiver::{
    parse_max_size, ConnectionSupervisor, FilesystemArchive, ImageStore, Listener, PostgresStore,
    RetentionManager,
};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.backend,
        "Starting picam receiver"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let background = CancellationToken::new();
    let (store, retention_handle) = build_store(&config, &background).await?;

    let supervisor = ConnectionSupervisor::new(store, config.listener.max_frame_bytes);
    let listener = Listener::bind(config.listener.bind_addr(), supervisor)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listener.bind_addr()))?;

    let listener_shutdown = listener.shutdown_token();
    let serve_handle = tokio::spawn(listener.serve(config.listener.shutdown_grace()));

    info!("Receiver started successfully");

    shutdown_signal().await;

    info!("Shutting down receiver");

    listener_shutdown.cancel();
    background.cancel();

    let summary = serve_handle.await.context("Listener task failed")?;
    if let Some(handle) = retention_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Retention task failed");
        }
    }

    info!(
        connections_accepted = summary.connections_accepted,
        drained = summary.drained,
        "Receiver stopped"
    );

    Ok(())
}

/// Load configuration from the file named on the command line, or the defaults.
fn load_config() -> Result<ReceiverConfig> {
    match std::env::args().nth(1) {
        Some(path) => ReceiverConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => ReceiverConfig::load().context("Failed to load configuration"),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("picam_receiver={}", level).parse()?)
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Open the configured backend. The filesystem backend also starts its
/// retention manager, which stops when `background` is cancelled.
async fn build_store(
    config: &ReceiverConfig,
    background: &CancellationToken,
) -> Result<(Arc<dyn ImageStore>, Option<JoinHandle<()>>)> {
    match config.backend {
        BackendKind::Postgres => {
            let database = config
                .database
                .as_ref()
                .context("Missing [database] section")?;

            let store = PostgresStore::new(database)
                .await
                .context("Failed to initialize PostgreSQL store")?;

            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok((Arc::new(store), None))
        }
        BackendKind::Filesystem => {
            let archive = config
                .archive
                .as_ref()
                .context("Missing [archive] section")?;

            let root = tokio::fs::metadata(&archive.root)
                .await
                .with_context(|| format!("Archive root {} is not accessible", archive.root.display()))?;
            if !root.is_dir() {
                bail!("Archive root {} is not a directory", archive.root.display());
            }

            let max_bytes =
                parse_max_size(&archive.max_size).context("Invalid archive.max_size")?;

            let manager = RetentionManager::new(
                &archive.root,
                max_bytes,
                archive.sweep_interval(),
                archive.sweep_every_writes,
            );
            let store = FilesystemArchive::new(&archive.root, &archive.image_extension)
                .with_retention(manager.trigger());

            info!(
                root = %archive.root.display(),
                max_bytes = max_bytes,
                "Filesystem archive ready"
            );

            let handle = tokio::spawn(manager.run(background.clone()));

            Ok((Arc::new(store), Some(handle)))
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
