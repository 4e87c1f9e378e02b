mod canvas;
mod config;
mod db;
mod protocol;
mod rate_limit;
mod routes;
mod services;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::{AppConfig, ConfigError};
use crate::db::pixels::PgPixelRepository;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("DATABASE_URL required")]
    MissingDatabaseUrl,
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("server failed: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        error!(error = %e, "pixelwar failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let mut config = AppConfig::load();
    config.validate()?;

    let database_url = std::env::var("DATABASE_URL").map_err(|_| StartupError::MissingDatabaseUrl)?;
    let pool = db::init_pool(&database_url).await?;
    let repo = Arc::new(PgPixelRepository::new(pool));

    let (persistence, _persist_task) =
        services::persistence::spawn_persistence_worker(repo, config.persistence.clone(), &config.canvas.default_color);

    let stored = persistence.load_all().await;
    let state = AppState::new(config, persistence);
    let loaded = state.lock_canvas().bulk_load(stored);
    info!(loaded, "canvas hydrated");

    let maintenance = services::maintenance::spawn_maintenance_task(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind { addr: addr.clone(), source })?;
    info!(%addr, width = state.config.canvas.width, height = state.config.canvas.height, "pixelwar listening");

    let app = routes::app(state.clone());
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested; refusing new edits");
            shutdown_state.begin_shutdown();
            shutdown_state.drain_edits();
            let closed = shutdown_state.broadcaster.close_all();
            info!(closed, "closed client connections");
        })
        .await
        .map_err(StartupError::Serve)?;

    maintenance.abort();

    let limit = Duration::from_secs(state.config.persistence.shutdown_timeout_secs);
    if let Err(e) = state.persistence.force_flush_all(limit).await {
        error!(error = %e, "final pixel flush failed");
    }

    let stats = state.session_stats(None);
    info!(
        active_pixels = stats.canvas.active_pixels,
        flushed_total = stats.persistence.flushed_total,
        dropped_total = stats.persistence.dropped_total,
        "pixelwar stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
