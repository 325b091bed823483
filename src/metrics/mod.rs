//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health, head height and watcher checkpoints
//! - Event intake, duplicates and reorg retractions
//! - Transaction submission and RPC retries
//! - Swap lifecycle transitions

use crate::chain::Chain;
use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_bridge_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_bridge_chain_block_height",
        "Latest head height seen per chain",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_CHECKPOINT: GaugeVec = register_gauge_vec!(
        "htlc_bridge_chain_checkpoint",
        "Last persisted watcher checkpoint per chain",
        &["chain"]
    ).unwrap();

    pub static ref WATCH_ERRORS: CounterVec = register_counter_vec!(
        "htlc_bridge_watch_errors_total",
        "Failed watcher polls",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_bridge_events_received_total",
        "Final events received by kind",
        &["chain", "kind"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "htlc_bridge_events_duplicate_total",
        "Redelivered events discarded",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_RETRACTED: CounterVec = register_counter_vec!(
        "htlc_bridge_events_retracted_total",
        "Buffered events dropped by a reorg",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "htlc_bridge_transactions_submitted_total",
        "Transactions submitted by operation",
        &["chain", "operation"]
    ).unwrap();

    pub static ref RPC_RETRIES: CounterVec = register_counter_vec!(
        "htlc_bridge_rpc_retries_total",
        "Retried RPC operations",
        &["operation"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_CREATED: CounterVec = register_counter_vec!(
        "htlc_bridge_swaps_created_total",
        "Accepted bridge requests",
        &["source", "dest"]
    ).unwrap();

    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "htlc_bridge_swap_transitions_total",
        "Swap state transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref REFUND_ATTEMPTS: CounterVec = register_counter_vec!(
        "htlc_bridge_refund_attempts_total",
        "Refund attempts by outcome",
        &["chain", "outcome"]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "htlc_bridge_wallet_balance",
        "Signer balance in whole native units",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_bridge_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_bridge_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: Chain, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain: Chain, height: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(height as f64);
}

pub fn record_checkpoint(chain: Chain, height: u64) {
    CHAIN_CHECKPOINT
        .with_label_values(&[chain.as_str()])
        .set(height as f64);
}

pub fn record_watch_error(chain: Chain) {
    WATCH_ERRORS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(chain: Chain, kind: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), kind])
        .inc();
}

pub fn record_duplicate_event(chain: Chain) {
    EVENTS_DUPLICATE.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_retraction(chain: Chain) {
    EVENTS_RETRACTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_submitted(chain: Chain, operation: &str) {
    TX_SUBMITTED
        .with_label_values(&[chain.as_str(), operation])
        .inc();
}

pub fn record_rpc_retry(operation: &str) {
    RPC_RETRIES.with_label_values(&[operation]).inc();
}

pub fn record_swap_created(source: Chain, dest: Chain) {
    SWAPS_CREATED
        .with_label_values(&[source.as_str(), dest.as_str()])
        .inc();
}

pub fn record_swap_transition(from: &str, to: &str) {
    SWAP_TRANSITIONS.with_label_values(&[from, to]).inc();
}

pub fn record_refund_attempt(chain: Chain, outcome: &str) {
    REFUND_ATTEMPTS
        .with_label_values(&[chain.as_str(), outcome])
        .inc();
}

pub fn record_wallet_balance(chain: Chain, balance: f64) {
    WALLET_BALANCE
        .with_label_values(&[chain.as_str()])
        .set(balance);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
