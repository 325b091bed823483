//! Volatile in-process store

use super::SwapStore;
use crate::chain::{Chain, EscrowRef};
use crate::coordination::swap::{Swap, SwapId, SwapStats, Transition};
use crate::error::{RelayerError, RelayerResult};
use crate::secret::Hashlock;

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    swaps: DashMap<SwapId, Swap>,
    transitions: DashMap<SwapId, Vec<Transition>>,
    checkpoints: DashMap<Chain, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy as persisted: the secret is dropped once public
    fn stored(swap: &Swap) -> Swap {
        let mut stored = swap.clone();
        stored.secret = swap.storable_secret().cloned();
        stored
    }

    fn find(&self, pred: impl Fn(&Swap) -> bool) -> Option<Swap> {
        self.swaps
            .iter()
            .find(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn insert_swap(&self, swap: &Swap, transition: &Transition) -> RelayerResult<()> {
        if self.swaps.contains_key(&swap.id) {
            return Err(RelayerError::Internal(format!("swap {} already exists", swap.id)));
        }
        self.swaps.insert(swap.id.clone(), Self::stored(swap));
        self.transitions
            .entry(swap.id.clone())
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn update_swap(&self, swap: &Swap, transition: Option<&Transition>) -> RelayerResult<()> {
        let Some(mut stored) = self.swaps.get_mut(&swap.id) else {
            return Err(RelayerError::SwapNotFound(swap.id.to_string()));
        };
        *stored = Self::stored(swap);
        drop(stored);

        if let Some(transition) = transition {
            self.transitions
                .entry(swap.id.clone())
                .or_default()
                .push(transition.clone());
        }
        Ok(())
    }

    async fn get_swap(&self, id: &SwapId) -> RelayerResult<Option<Swap>> {
        Ok(self.swaps.get(id).map(|s| s.value().clone()))
    }

    async fn find_by_escrow(&self, chain: Chain, escrow: &EscrowRef) -> RelayerResult<Option<Swap>> {
        Ok(self.find(|s| {
            (s.source_chain == chain && s.source_escrow_ref.as_ref() == Some(escrow))
                || (s.dest_chain == chain && s.dest_escrow_ref.as_ref() == Some(escrow))
        }))
    }

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>> {
        Ok(self.find(|s| s.hashlock == *hashlock))
    }

    async fn list_active(&self) -> RelayerResult<Vec<Swap>> {
        let mut active: Vec<Swap> = self
            .swaps
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.value().clone())
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    async fn transitions(&self, id: &SwapId) -> RelayerResult<Vec<Transition>> {
        Ok(self
            .transitions
            .get(id)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }

    async fn get_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>> {
        Ok(self.checkpoints.get(&chain).map(|c| *c))
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()> {
        self.checkpoints.insert(chain, height);
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        Ok(SwapStats::from_states(self.swaps.iter().map(|s| s.state)))
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::swap::SwapState;
    use crate::secret::Secret;
    use chrono::{Duration, Utc};

    fn swap() -> Swap {
        let now = Utc::now();
        Swap::new(
            Chain::Tron,
            Chain::Ethereum,
            "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into(),
            "0x00000000000000000000000000000000000000bb".into(),
            "100".into(),
            "0.01".into(),
            Secret::from_bytes([2u8; 32]),
            now + Duration::hours(2),
            now + Duration::hours(1),
            now,
        )
    }

    #[tokio::test]
    async fn insert_update_and_lookup() {
        let store = MemoryStore::new();
        let mut s = swap();
        store.insert_swap(&s, &s.created_transition()).await.unwrap();

        s.source_escrow_ref = Some(EscrowRef::new("0xaa"));
        let t = s.transition(SwapState::SourceLocked, "confirmed", Utc::now()).unwrap();
        store.update_swap(&s, Some(&t)).await.unwrap();

        let found = store
            .find_by_escrow(Chain::Tron, &EscrowRef::new("0xaa"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.state, SwapState::SourceLocked);
        assert!(store
            .find_by_escrow(Chain::Ethereum, &EscrowRef::new("0xaa"))
            .await
            .unwrap()
            .is_none());
        assert!(store.find_by_hashlock(&s.hashlock).await.unwrap().is_some());
        assert_eq!(store.transitions(&s.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn revealed_secret_is_not_kept() {
        let store = MemoryStore::new();
        let mut s = swap();
        store.insert_swap(&s, &s.created_transition()).await.unwrap();
        assert_eq!(store.get_swap(&s.id).await.unwrap().unwrap().secret, s.secret);

        let now = Utc::now();
        for next in [SwapState::SourceLocked, SwapState::DestLocked, SwapState::SecretRevealed] {
            let t = s.transition(next, "step", now).unwrap();
            store.update_swap(&s, Some(&t)).await.unwrap();
        }
        assert!(s.secret.is_some());
        assert!(store.get_swap(&s.id).await.unwrap().unwrap().secret.is_none());
    }

    #[tokio::test]
    async fn terminal_swaps_leave_active_list() {
        let store = MemoryStore::new();
        let mut s = swap();
        store.insert_swap(&s, &s.created_transition()).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        let t = s.transition(SwapState::Failed, "rejected", Utc::now()).unwrap();
        store.update_swap(&s, Some(&t)).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_state.get(&SwapState::Failed), Some(&1));
    }

    #[tokio::test]
    async fn checkpoints_per_chain() {
        let store = MemoryStore::new();
        assert_eq!(store.get_checkpoint(Chain::Near).await.unwrap(), None);
        store.save_checkpoint(Chain::Near, 77).await.unwrap();
        assert_eq!(store.get_checkpoint(Chain::Near).await.unwrap(), Some(77));
        assert_eq!(store.get_checkpoint(Chain::Tron).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        let s = swap();
        store.insert_swap(&s, &s.created_transition()).await.unwrap();
        assert!(store.insert_swap(&s, &s.created_transition()).await.is_err());
    }
}
