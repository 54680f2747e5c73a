use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stormforge_api::background;
use stormforge_api::config::{EngineConfig, ServerConfig};
use stormforge_api::engine::Orchestrator;
use stormforge_api::router::build_app_router;
use stormforge_api::state::AppState;
use stormforge_api::ws;
use stormforge_db::{JobStore, MemoryStore, PgStore, QuotaStore, TargetListStore};
use stormforge_events::{EventBus, JobRecorder, Recorder};

/// How long to wait for the recorder to flush after shutdown.
const RECORDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stormforge_api=debug,stormforge_events=info,tower_http=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let engine_config = EngineConfig::from_env().context("Invalid engine configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    tracing::info!(tool_path = %engine_config.tool_path, "Loaded engine configuration");

    // --- Stores ---
    let (pool, job_store, target_store, quota_store): (
        _,
        Arc<dyn JobStore>,
        Arc<dyn TargetListStore>,
        Arc<dyn QuotaStore>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = stormforge_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            stormforge_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            tracing::info!("Database health check passed");

            stormforge_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            let store = Arc::new(PgStore::new(pool.clone()));
            (Some(pool), store.clone() as _, store.clone() as _, store as _)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            (None, store.clone() as _, store.clone() as _, store as _)
        }
    };

    // --- Event bus and recorder ---
    let bus = Arc::new(EventBus::new(engine_config.subscriber_buffer));
    let (recorder, records) = Recorder::new();
    let recorder_cancel = CancellationToken::new();
    let recorder_handle = tokio::spawn(JobRecorder::run(
        Arc::clone(&job_store),
        records,
        recorder_cancel.clone(),
    ));

    // --- Orchestrator ---
    let orchestrator = Arc::new(Orchestrator::new(
        &engine_config,
        Arc::clone(&bus),
        recorder,
        job_store,
        target_store,
        quota_store,
    ));
    if let Err(e) = orchestrator.load().await {
        tracing::warn!(error = %e, "Failed to load quotas and target lists, starting with defaults");
    }

    // --- WebSocket manager and heartbeat ---
    let tasks_cancel = CancellationToken::new();
    let ws_manager = Arc::new(ws::WsManager::with_capacity(engine_config.subscriber_buffer));
    let heartbeat_handle = ws::start_heartbeat(
        Arc::clone(&ws_manager),
        Duration::from_secs(engine_config.ws_heartbeat_interval_secs),
        Duration::from_secs(engine_config.ws_heartbeat_timeout_secs),
        tasks_cancel.clone(),
    );

    // --- Background tasks ---
    let retention_handle = tokio::spawn(background::retention::run(
        Arc::clone(&orchestrator),
        engine_config.job_retention(),
        Duration::from_secs(engine_config.retention_sweep_secs),
        tasks_cancel.clone(),
    ));
    let policy_handle = tokio::spawn(background::policy_refresh::run(
        Arc::clone(&orchestrator),
        Duration::from_secs(engine_config.target_policy_refresh_secs),
        tasks_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        engine_config: Arc::new(engine_config),
        orchestrator: Arc::clone(&orchestrator),
        ws_manager: Arc::clone(&ws_manager),
        pool,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config.host.parse().context("Invalid HOST address")?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    // Running jobs are cancelled and their processes reaped before the
    // recorder is flushed, so their terminal state is persisted.
    orchestrator
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;

    tasks_cancel.cancel();
    let _ = tokio::join!(heartbeat_handle, retention_handle, policy_handle);
    tracing::info!("Background tasks stopped");

    recorder_cancel.cancel();
    if tokio::time::timeout(RECORDER_FLUSH_TIMEOUT, recorder_handle)
        .await
        .is_err()
    {
        tracing::warn!("Job recorder did not flush before timeout");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
