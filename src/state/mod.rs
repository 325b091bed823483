//! Swap state persistence
//!
//! Handles:
//! - Swap records and their append-only transition log
//! - Block checkpoints for restart recovery
//! - Per-state statistics for the operator API

mod manager;
mod memory;

pub use manager::PgStore;
pub use memory::MemoryStore;

use crate::chain::{Chain, EscrowRef};
use crate::config::DatabaseConfig;
use crate::coordination::swap::{Swap, SwapId, SwapStats, Transition};
use crate::error::RelayerResult;
use crate::secret::Hashlock;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Storage for swaps and watcher checkpoints
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Persist a new swap together with its creation transition
    async fn insert_swap(&self, swap: &Swap, transition: &Transition) -> RelayerResult<()>;

    /// Overwrite a swap; appends `transition` atomically when present
    async fn update_swap(&self, swap: &Swap, transition: Option<&Transition>) -> RelayerResult<()>;

    async fn get_swap(&self, id: &SwapId) -> RelayerResult<Option<Swap>>;

    /// Swap owning `escrow` on `chain`, on either leg
    async fn find_by_escrow(&self, chain: Chain, escrow: &EscrowRef) -> RelayerResult<Option<Swap>>;

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>>;

    /// Swaps that have not reached a terminal state
    async fn list_active(&self) -> RelayerResult<Vec<Swap>>;

    async fn transitions(&self, id: &SwapId) -> RelayerResult<Vec<Transition>>;

    async fn get_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()>;

    async fn stats(&self) -> RelayerResult<SwapStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Open the store named by `database.url`
pub async fn open_store(config: &DatabaseConfig) -> RelayerResult<Arc<dyn SwapStore>> {
    if config.url.starts_with("memory://") {
        info!("Using in-memory swap store; state will not survive restarts");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = PgStore::new(config).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}
