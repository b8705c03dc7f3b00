//! # Audio Convert Backend - Main Application Entry Point
//!
//! HTTP service that accepts uploaded media, converts it in the background
//! to a canonical WAV profile and lets clients poll for and download the
//! result.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **error**: Core error taxonomy and HTTP error responses
//! - **audio**: Decode, normalize, encode and fingerprint primitives
//! - **conversion**: The per-task pipeline and its output verification
//! - **tasks**: Task records, the task store, dispatcher, supervisor, sweeper
//! - **state**: Shared application state
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request metrics
//! - **handlers**: Upload, status and download endpoints
//!
//! ## Startup Order:
//! 1. `.env`, tracing, configuration
//! 2. storage directories and the task store
//! 3. supervisor and retention sweeper
//! 4. HTTP server
//!
//! ## Shutdown Order:
//! SIGINT/SIGTERM stops the HTTP server first, then the supervisor signals
//! the background jobs and waits for them up to the configured grace period.

mod audio;
mod config;
mod conversion;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod tasks;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use audio::SymphoniaBackend;
use config::AppConfig;
use conversion::ConversionPipeline;
use state::AppState;
use std::sync::Arc;
use tasks::{DispatchSettings, Dispatcher, JsonTaskStore, RetentionSweeper, Supervisor, TaskStore};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        target = ?config.target_profile(),
        retention_minutes = config.retention.retention_minutes,
        "Configuration loaded"
    );

    for dir in [&config.storage.upload_dir, &config.storage.output_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
    }

    let task_store = JsonTaskStore::open(&config.storage.tasks_file);
    if let Some(path) = task_store.path() {
        info!(path = %path.display(), tasks = task_store.list_all().len(), "Task store ready");
    }
    let store: Arc<dyn TaskStore> = Arc::new(task_store);
    let supervisor = Arc::new(Supervisor::new(tokio::runtime::Handle::current()));

    let pipeline = Arc::new(ConversionPipeline::new(
        Arc::new(SymphoniaBackend),
        config.target_profile(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        pipeline,
        Arc::clone(&supervisor),
        DispatchSettings {
            output_dir: config.storage.output_dir.clone(),
            task_timeout: config.task_timeout(),
            download_grace: config.download_grace(),
        },
    ));

    let sweeper = Arc::new(RetentionSweeper::new(
        Arc::clone(&store),
        vec![config.storage.upload_dir.clone(), config.storage.output_dir.clone()],
        config.retention_window(),
        config.sweep_interval(),
    ));
    supervisor.spawn("retention-sweeper", sweeper.run(supervisor.shutdown_signal()));

    let app_state = AppState::new(config.clone(), store, dispatcher, Arc::clone(&supervisor));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    // Multipart parsing streams to disk, but cap the raw body as well
    let payload_limit = usize::try_from(config.limits.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::PayloadConfig::new(payload_limit))
            .wrap(cors)
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .route("/upload", web::post().to(handlers::upload))
            .route("/status/{task_id}", web::get().to(handlers::status))
            .route("/download/{task_id}", web::get().to(handlers::download))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    // Signals are handled below so background jobs can be drained
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Server exited"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    supervisor.shutdown(config.shutdown_grace()).await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Set up tracing with `RUST_LOG` support.
///
/// Defaults to `audio_convert_backend=debug,actix_web=info` when `RUST_LOG`
/// is not set.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_convert_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on the first SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}
