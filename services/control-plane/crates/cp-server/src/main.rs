//! Fleet control plane entry point.
//!
//! Initialises tracing, loads configuration from environment variables
//! (prefixed with `FLEET_CP_`), connects to Valkey, and runs the agent
//! manager with a periodic staleness sweep behind a small HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_common::ControlPlaneConfig;
use fleet_cp_server::coordinator::CoordinatorSettings;
use fleet_cp_server::http;
use fleet_cp_server::leadership::LeaderSignal;
use fleet_cp_server::metadata::KvMetadataStore;
use fleet_cp_server::processor::RetryPolicy;
use fleet_cp_server::store::{DeadlineStore, DistributedStore, ValkeyStore};
use fleet_cp_server::{AgentManager, ManagerSettings};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Tracing with RUST_LOG env filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("fleet-control-plane starting");

    // 2. Configuration from FLEET_CP_* env vars.
    let config: ControlPlaneConfig = envy::prefixed("FLEET_CP_")
        .from_env()
        .context("failed to load config from FLEET_CP_* env vars")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid FLEET_CP_* configuration")?;

    // 3. Password from the Docker secret file, when configured.
    let valkey_pass = match &config.valkey_pass_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read password from {path}"))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        valkey_url = %config.valkey_url,
        leader = config.leader,
        tls_enabled = config.valkey_tls_paths().is_some(),
        "configuration loaded",
    );

    // 4. Store, metadata store and manager.
    let valkey = ValkeyStore::connect(&config, valkey_pass)
        .await
        .context("failed to initialise Valkey connection")?;
    let store: Arc<dyn DistributedStore> =
        Arc::new(DeadlineStore::new(Arc::new(valkey), config.store_timeout()));
    let mds = Arc::new(KvMetadataStore::new(Arc::clone(&store)));

    let settings = ManagerSettings {
        coordinator: CoordinatorSettings {
            session_ttl: config.session_ttl(),
            lock_timeout: config.lock_timeout(),
            ..CoordinatorSettings::default()
        },
        retry: RetryPolicy {
            max_attempts: config.update_max_attempts,
            ..RetryPolicy::default()
        }
        .with_backoff(
            Duration::from_millis(config.update_backoff_initial_ms),
            Duration::from_millis(config.update_backoff_max_ms),
        ),
    };
    let manager = Arc::new(
        AgentManager::new(store, mds, LeaderSignal::fixed(config.leader), settings)
            .await
            .context("failed to start agent manager")?,
    );

    // 5. Background tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(sweep_loop(
        Arc::clone(&manager),
        config.sweep_interval(),
        shutdown_rx,
    ));

    if let Some(mut dead_letters) = manager.take_dead_letters() {
        tokio::spawn(async move {
            while let Some(letter) = dead_letters.recv().await {
                tracing::error!(
                    agent_id = %letter.message.agent_id,
                    attempts = letter.attempts,
                    error = %letter.last_error,
                    "agent update dead-lettered",
                );
            }
        });
    }

    // 6. HTTP surface.
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("failed to bind TCP listener")?;
    tracing::info!("control plane ready on http://{}", config.listen_addr);

    axum::serve(listener, http::router(Arc::clone(&manager)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // 7. Orderly stop: sweep first, then the manager.
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "sweep task ended abnormally");
    }
    manager.shutdown().await;

    tracing::info!("fleet-control-plane shut down");
    Ok(())
}

/// Evict stale agents every `period` until told to stop.
async fn sweep_loop(
    manager: Arc<AgentManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.update_agent_state().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        tracing::info!(count = evicted.len(), "staleness sweep evicted agents");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "staleness sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Wait for SIGINT (Ctrl-C) for graceful shutdown.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
