//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent swaps never collide
//! - Resync with the chain after a nonce conflict
//! - Reuse of nonces whose transaction never reached the mempool

use crate::chain::ChainProvider;
use crate::error::RelayerResult;

use ethers::types::Address;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Signer nonce state
#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out; `None` until first synced
    current: Option<u64>,
    /// In-flight transactions: nonce -> tx hash
    pending: BTreeMap<u64, String>,
    /// Highest nonce seen mined
    confirmed: Option<u64>,
}

/// Tracks the nonce of one signing address on one EVM chain
pub struct NonceManager {
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            state: Mutex::new(NonceState::default()),
        }
    }

    /// Allocate the next nonce, syncing with the chain on first use
    pub async fn next_nonce(&self, provider: &ChainProvider) -> RelayerResult<u64> {
        let mut state = self.state.lock().await;
        let nonce = match state.current {
            Some(n) => n,
            None => provider.get_transaction_count(self.wallet_address).await?,
        };
        state.current = Some(nonce + 1);

        debug!("Allocated nonce {} for {:?}", nonce, self.wallet_address);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        let mut state = self.state.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
    }

    /// Release a nonce whose transaction was never accepted
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed back
        if state.current == Some(nonce + 1) {
            state.current = Some(nonce);
        }
    }

    /// Resync with the chain after a nonce conflict
    pub async fn sync(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        let mut state = self.state.lock().await;

        let stale: Vec<u64> = state.pending.range(..on_chain).map(|(n, _)| *n).collect();
        for nonce in stale {
            state.pending.remove(&nonce);
        }

        state.current = Some(resynced_nonce(state.current, on_chain, state.pending.is_empty()));
        if let Some(confirmed) = state.confirmed {
            if on_chain > confirmed + 1 {
                warn!(
                    "Nonce of {:?} advanced outside the relayer: expected {}, chain at {}",
                    self.wallet_address,
                    confirmed + 1,
                    on_chain
                );
            }
        }
        state.confirmed = on_chain.checked_sub(1);

        Ok(())
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// With nothing in flight the chain count is authoritative, which also closes
/// gaps left by transactions that never propagated
fn resynced_nonce(current: Option<u64>, on_chain: u64, idle: bool) -> u64 {
    match current {
        Some(local) if !idle => local.max(on_chain),
        _ => on_chain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_closes_gaps_when_idle() {
        assert_eq!(resynced_nonce(Some(9), 7, true), 7);
        assert_eq!(resynced_nonce(Some(9), 7, false), 9);
        assert_eq!(resynced_nonce(Some(3), 7, false), 7);
        assert_eq!(resynced_nonce(None, 4, false), 4);
    }

    #[tokio::test]
    async fn release_returns_latest_nonce_only() {
        let manager = NonceManager::new(Address::zero());
        {
            let mut state = manager.state.lock().await;
            state.current = Some(5);
        }
        manager.mark_pending(4, "0xaa").await;
        manager.release(4).await;
        assert_eq!(manager.state.lock().await.current, Some(4));
        assert_eq!(manager.pending_count().await, 0);

        manager.release(1).await;
        assert_eq!(manager.state.lock().await.current, Some(4));
    }

    #[tokio::test]
    async fn confirm_tracks_highest() {
        let manager = NonceManager::new(Address::zero());
        manager.mark_pending(2, "0x02").await;
        manager.mark_pending(3, "0x03").await;
        manager.confirm(3).await;
        manager.confirm(2).await;
        let state = manager.state.lock().await;
        assert_eq!(state.confirmed, Some(3));
        assert!(state.pending.is_empty());
    }
}
