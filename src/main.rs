use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use slotlock::catalog::Catalog;
use slotlock::config::Config;
use slotlock::engine::Engine;
use slotlock::http::{self, AppState};
use slotlock::notify::NotifyHub;
use slotlock::reaper::Reaper;
use slotlock::store::WalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    slotlock::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(WalStore::open(&config.wal_path())?);
    let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store.clone(), catalog.clone(), notify, config.engine()));

    let reaper = Reaper::start(
        engine.clone(),
        store,
        config.sweep_interval,
        config.compact_threshold,
    );

    if config.operator_token.is_none() {
        warn!("SLOTLOCK_OPERATOR_TOKEN not set, operator routes are unauthenticated");
    }
    let state = AppState::new(engine, config.max_sessions, config.operator_token.clone());
    let sessions = state.sessions.clone();
    let close_sessions = state.shutdown.clone();

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotlock listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  catalog: {} services", catalog.services().len());
    info!("  lease_ttl: {}s", config.lease_ttl.as_secs());
    info!("  max_sessions: {}", config.max_sessions);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Live sessions close themselves and release their leases.
            close_sessions.cancel();
        })
        .await?;
    info!("shutdown signal received, stopped accepting");

    // Wait for live sessions to close and release their leases (up to 10s)
    info!("draining sessions...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if sessions.available_permits() == config.max_sessions {
            info!("all sessions drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_sessions - sessions.available_permits();
                warn!("drain timeout, {remaining} sessions still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    reaper.shutdown().await;
    info!("slotlock stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
