//! HTLC Bridge Relayer - hash-time-locked swaps between EVM, TRON and NEAR
//!
//! The relayer accepts bridge requests, locks an escrow on the source chain,
//! mirrors it on the destination chain, and settles or refunds both legs as
//! finalized chain events arrive.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod oracle;
mod secret;
mod state;
mod tx;

use chain::{ChainManager, EventSink};
use config::{LoggingConfig, Settings};
use coordination::{CoordinatorConfig, SwapCoordinator};
use metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it decides the log format
    let settings = Settings::load()?;
    init_logging(&settings.logging);

    info!(
        "Starting HTLC Bridge Relayer v{} ({})",
        env!("CARGO_PKG_VERSION"),
        settings.relayer.instance_id
    );
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Swap store
    let store = state::open_store(&settings.database).await?;
    info!("Swap store ready");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized");

    let oracle = oracle::from_config(&settings.oracle)?;

    // Initialize swap coordinator
    let coordinator = Arc::new(SwapCoordinator::new(
        chain_manager.clone(),
        store.clone(),
        oracle,
        CoordinatorConfig {
            timelocks: settings.timelock.clone(),
            sweep_interval: Duration::from_millis(settings.relayer.sweep_interval_ms),
            dedupe_window: Duration::from_secs(settings.relayer.dedupe_window_secs),
        },
    ));
    info!("Swap coordinator initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            coordinator: coordinator.clone(),
            store: store.clone(),
            chains: chain_manager.clone(),
        };
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start the coordinator sweep loop; it recovers active swaps first
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Swap coordinator error: {}", e);
            }
        }
    });

    // Start chain watchers, delivering finalized events to the coordinator
    let watcher_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let sink: Arc<dyn EventSink> = coordinator.clone();
        let store = store.clone();
        async move {
            if let Err(e) = chain_manager.start_watchers(sink, store).await {
                error!("Chain watcher error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;
                let mut healthy = true;

                // Check chain connections
                for (chain, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Chain {} health check failed", chain);
                        healthy = false;
                    }
                }

                record_wallet_balances(&chain_manager).await;

                // Check store connection
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("HTLC Bridge Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    coordinator.stop().await;
    chain_manager.stop().await;

    // Abort background tasks
    api_handle.abort();
    watcher_handle.abort();
    coordinator_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Bridge Relayer stopped");
    Ok(())
}

/// Export each signer's balance as a gauge
async fn record_wallet_balances(chain_manager: &ChainManager) {
    for chain in chain_manager.connected_chains() {
        let Ok(adapter) = chain_manager.get_adapter(chain) else {
            continue;
        };
        match adapter.get_balance(&adapter.signer_address()).await {
            Ok(balance) => match balance.parse::<f64>() {
                Ok(value) => metrics::record_wallet_balance(chain, value),
                Err(e) => warn!("Unparseable {} balance {:?}: {}", chain, balance, e),
            },
            Err(e) => warn!("Balance check failed for {}: {}", chain, e),
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = config
        .filter
        .clone()
        .unwrap_or_else(|| "info,htlc_bridge_relayer=debug,sqlx=warn,hyper=warn".to_string());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await.context("Ctrl+C handler") {
            error!("{:#}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
