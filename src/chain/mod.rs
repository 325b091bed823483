//! Chain module - uniform HTLC adapters over EVM, TRON and NEAR
//!
//! This module provides:
//! - The [`ChainAdapter`] capability set every chain implements
//! - EVM (ethers JSON-RPC), TRON (HTTP API) and NEAR (JSON-RPC) adapters
//! - Finality buffering and checkpointed event watching
//! - Retry with backoff for transient RPC failures

pub mod contract;
pub mod evm;
pub mod finality;
pub mod http;
pub mod listener;
pub mod near;
pub mod provider;
pub mod retry;
pub mod tron;
pub mod units;

#[cfg(test)]
pub mod simulated;

pub use finality::FinalityBuffer;
pub use listener::{watch_events, EventSink, EventWatcher, WatchBatch, WatchConfig};
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainEvent;
use crate::secret::{Hashlock, Secret};
use crate::state::SwapStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Supported ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Tron,
    Near,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Ethereum, Chain::Tron, Chain::Near];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Tron => "tron",
            Chain::Near => "near",
        }
    }

    /// Symbol of the native asset bridged on this chain
    pub fn native_asset(&self) -> &'static str {
        match self {
            Chain::Ethereum => "eth",
            Chain::Tron => "trx",
            Chain::Near => "near",
        }
    }

    /// Base-unit precision of the native asset
    pub fn decimals(&self) -> u32 {
        match self {
            Chain::Ethereum => units::WEI_DECIMALS,
            Chain::Tron => units::SUN_DECIMALS,
            Chain::Near => units::YOCTO_DECIMALS,
        }
    }

    /// Confirmations after which an event is treated as irreversible
    pub fn default_finality_depth(&self) -> u64 {
        match self {
            Chain::Ethereum => 12,
            // Solidified blocks: 2/3 of 27 super representatives
            Chain::Tron => 19,
            Chain::Near => 3,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "evm" => Ok(Chain::Ethereum),
            "tron" | "trx" => Ok(Chain::Tron),
            "near" => Ok(Chain::Near),
            other => Err(RelayerError::InvalidRequest(format!("unknown chain: {}", other))),
        }
    }
}

/// Chain-specific escrow identifier (EVM/TRON contract id, NEAR htlc id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowRef(String);

impl EscrowRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EscrowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final outcome of an escrow as reported by the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Completed,
    Refunded,
}

/// Result of a completion or refund call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRef {
    /// Transaction accepted by the chain
    Submitted(String),
    /// Escrow was already settled; nothing was submitted
    AlreadySettled(Settlement),
}

impl TxRef {
    pub fn hash(&self) -> Option<&str> {
        match self {
            TxRef::Submitted(hash) => Some(hash),
            TxRef::AlreadySettled(_) => None,
        }
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRef::Submitted(hash) => f.write_str(hash),
            TxRef::AlreadySettled(Settlement::Completed) => f.write_str("already-completed"),
            TxRef::AlreadySettled(Settlement::Refunded) => f.write_str("already-refunded"),
        }
    }
}

/// Lock request handed to `create_escrow`
#[derive(Debug, Clone)]
pub struct EscrowParams {
    pub hashlock: Hashlock,
    pub beneficiary: String,
    /// Whole native units, decimal string
    pub amount: String,
    pub timelock: DateTime<Utc>,
}

/// Uniform HTLC capability set implemented once per chain
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Address the coordinator signs with on this chain
    fn signer_address(&self) -> String;

    fn finality_depth(&self) -> u64;

    /// Lock funds; retries transient failures, fails with
    /// `EscrowCreationFailed` when the chain refuses the lock
    async fn create_escrow(&self, params: &EscrowParams) -> RelayerResult<EscrowRef>;

    /// Reveal the secret to release the escrow; idempotent
    async fn complete_escrow(&self, escrow: &EscrowRef, secret: &Secret) -> RelayerResult<TxRef>;

    /// Reclaim an expired escrow; the chain decides whether it has expired
    async fn refund_escrow(&self, escrow: &EscrowRef) -> RelayerResult<TxRef>;

    /// Secret published by a completed escrow, when the chain keeps it
    /// readable
    async fn revealed_secret(&self, escrow: &EscrowRef) -> RelayerResult<Option<Secret>>;

    /// Current head height
    async fn latest_height(&self) -> RelayerResult<u64>;

    /// HTLC events in `[from, to]`, without any finality filtering
    async fn fetch_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>>;

    /// Balance in whole native units
    async fn get_balance(&self, address: &str) -> RelayerResult<String>;

    fn is_valid_address(&self, address: &str) -> bool;
}

/// Map a chain's revert/failure message onto the error taxonomy
pub fn classify_rejection(chain: Chain, escrow: Option<&EscrowRef>, reason: &str) -> RelayerError {
    let lower = reason.to_ascii_lowercase();

    if lower.contains("timelock not yet passed")
        || lower.contains("timelock not expired")
        || lower.contains("not expired yet")
        || lower.contains("refundable: timelock")
    {
        return RelayerError::TimelockNotExpired {
            chain,
            escrow_ref: escrow.map(|e| e.to_string()).unwrap_or_default(),
        };
    }

    if lower.contains("insufficient funds")
        || lower.contains("insufficient balance")
        || lower.contains("notenoughbalance")
        || lower.contains("balance is not sufficient")
    {
        return RelayerError::InsufficientBalance {
            chain,
            have: "unknown".to_string(),
            need: "unknown".to_string(),
        };
    }

    if lower.contains("nonce too low")
        || lower.contains("invalidnonce")
        || lower.contains("underpriced")
        || lower.contains("already known")
        || lower.contains("dup_transaction")
        || lower.contains("server_busy")
        || lower.contains("timeout")
    {
        return RelayerError::TransientRpc {
            chain,
            message: reason.to_string(),
        };
    }

    RelayerError::ChainRejection {
        chain,
        reason: reason.to_string(),
    }
}

/// Manages the adapters of all configured chains
pub struct ChainManager {
    /// Adapters indexed by chain
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
    /// Watch loop settings indexed by chain
    watch_configs: HashMap<Chain, WatchConfig>,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub async fn new(settings: &Settings) -> RelayerResult<Self> {
        let mut adapters: HashMap<Chain, Arc<dyn ChainAdapter>> = HashMap::new();
        let mut watch_configs = HashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} ({}) as {}",
                chain_config.name, name, chain_config.chain
            );

            let retry = settings.retry.clone();
            let adapter: Arc<dyn ChainAdapter> = match chain_config.chain {
                Chain::Ethereum => {
                    Arc::new(evm::EvmAdapter::new(chain_config.clone(), retry).await?)
                }
                Chain::Tron => Arc::new(tron::TronAdapter::new(chain_config.clone(), retry)?),
                Chain::Near => Arc::new(near::NearAdapter::new(chain_config.clone(), retry)?),
            };

            info!(
                "Chain {} initialized, signer {}",
                chain_config.name,
                adapter.signer_address()
            );

            watch_configs.insert(chain_config.chain, WatchConfig::from_chain(chain_config));
            adapters.insert(chain_config.chain, adapter);
        }

        Ok(Self {
            adapters,
            watch_configs,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Build a manager around already-constructed adapters
    pub fn from_adapters(adapters: Vec<(Arc<dyn ChainAdapter>, WatchConfig)>) -> Self {
        let mut by_chain = HashMap::new();
        let mut watch_configs = HashMap::new();
        for (adapter, watch) in adapters {
            watch_configs.insert(adapter.chain(), watch);
            by_chain.insert(adapter.chain(), adapter);
        }
        Self {
            adapters: by_chain,
            watch_configs,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Get adapter for a specific chain
    pub fn get_adapter(&self, chain: Chain) -> RelayerResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or(RelayerError::ChainNotFound(chain))
    }

    /// Start one event watcher per chain; returns when all of them stop
    pub async fn start_watchers(
        &self,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn SwapStore>,
    ) -> RelayerResult<()> {
        let mut handles = Vec::new();

        for (chain, adapter) in &self.adapters {
            let watch = self
                .watch_configs
                .get(chain)
                .cloned()
                .unwrap_or_default();
            let watcher = EventWatcher::new(adapter.clone(), sink.clone(), store.clone(), watch);
            let shutdown = self.shutdown.clone();
            let chain = *chain;

            let handle = tokio::spawn(async move {
                loop {
                    if *shutdown.read().await {
                        break;
                    }

                    if let Err(e) = watcher.run(shutdown.clone()).await {
                        error!("Watcher error for chain {}: {}", chain, e);
                        // Restart from the last checkpoint after a delay
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            });

            handles.push(handle);
        }

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(Chain, bool)> {
        let mut results = Vec::new();

        for (chain, adapter) in &self.adapters {
            let healthy = match adapter.latest_height().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Health check failed for chain {}: {}", chain, e);
                    false
                }
            };
            results.push((*chain, healthy));

            crate::metrics::record_chain_health(*chain, healthy);
        }

        results.sort_by_key(|(chain, _)| *chain);
        results
    }

    /// Get all connected chains
    pub fn connected_chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.adapters.keys().copied().collect();
        chains.sort();
        chains
    }

    /// Stop all chain watchers
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}

/// Label used for retry logs and the retry counter
pub(crate) fn retry_label(chain: Chain, op: &str) -> String {
    format!("{}:{}", chain, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timelock_rejections_from_each_chain() {
        let escrow = EscrowRef::new("0xabc");
        for reason in [
            "execution reverted: refundable: timelock not yet passed",
            "Smart contract panicked: Timelock not expired",
            "Smart contract panicked: Swap not expired yet",
        ] {
            assert!(matches!(
                classify_rejection(Chain::Ethereum, Some(&escrow), reason),
                RelayerError::TimelockNotExpired { .. }
            ));
        }
    }

    #[test]
    fn classifies_nonce_conflicts_as_transient() {
        let err = classify_rejection(Chain::Ethereum, None, "nonce too low");
        assert!(err.is_retryable());
        let err = classify_rejection(Chain::Near, None, "InvalidNonce { tx_nonce: 5, ak_nonce: 7 }");
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_reverts_as_permanent() {
        let err = classify_rejection(Chain::Tron, None, "REVERT opcode executed");
        assert!(err.is_permanent());
        let err = classify_rejection(Chain::Ethereum, None, "insufficient funds for gas * price + value");
        assert!(matches!(err, RelayerError::InsufficientBalance { .. }));
    }

    #[test]
    fn chain_parses_aliases() {
        assert_eq!("ETH".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("trx".parse::<Chain>().unwrap(), Chain::Tron);
        assert!("solana".parse::<Chain>().is_err());
    }
}
