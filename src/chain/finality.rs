//! Finality buffering for rescanned chain events
//!
//! Every chain can reorganize its most recent blocks:
//! - Ethereum: probabilistic, 12 blocks by default
//! - TRON: solidified after 19 of 27 super representatives confirm
//! - NEAR: Doomslug finality, 3 blocks by default
//!
//! The watcher rescans the unconfirmed window on every poll. Events that
//! reach the finality depth are released; buffered events that disappear
//! from a rescan were on an orphaned block and are retracted.

use super::Chain;
use crate::events::ChainEvent;

use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of applying one rescan to the buffer
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanOutcome {
    /// Events that reached finality, in height order
    pub finalized: Vec<ChainEvent>,
    /// Buffered events missing from the rescan
    pub retracted: Vec<ChainEvent>,
    /// Highest height below which everything has been released
    pub checkpoint: u64,
}

/// Holds events that are not yet deep enough to act on
#[derive(Debug)]
pub struct FinalityBuffer {
    chain: Chain,
    depth: u64,
    /// Unconfirmed events keyed by block height
    pending: BTreeMap<u64, Vec<ChainEvent>>,
    /// Every height at or below this has been released
    checkpoint: u64,
}

impl FinalityBuffer {
    pub fn new(chain: Chain, depth: u64, checkpoint: u64) -> Self {
        Self {
            chain,
            depth,
            pending: BTreeMap::new(),
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Next height to scan from
    pub fn scan_start(&self) -> u64 {
        self.checkpoint + 1
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_final(&self, height: u64, head: u64) -> bool {
        head.saturating_sub(height) >= self.depth && height <= head
    }

    /// Apply a fresh scan of `[from, to]` observed with chain head `head`
    pub fn apply(&mut self, from: u64, to: u64, head: u64, mut events: Vec<ChainEvent>) -> ScanOutcome {
        events.sort_by_key(|e| e.block_height);

        // Anything buffered in the rescanned window that is no longer
        // reported at the same height was orphaned
        let rescanned: Vec<u64> = self.pending.range(from..=to).map(|(h, _)| *h).collect();
        let mut retracted = Vec::new();
        for height in rescanned {
            let Some(previous) = self.pending.remove(&height) else {
                continue;
            };
            for old in previous {
                let still_there = events
                    .iter()
                    .any(|e| e.block_height == height && e.scan_key() == old.scan_key());
                if !still_there {
                    warn!(
                        "{} {} for {} at height {} was orphaned",
                        self.chain,
                        old.kind,
                        old.escrow_ref,
                        height
                    );
                    retracted.push(old);
                }
            }
        }

        let mut finalized = Vec::new();
        for event in events {
            if event.block_height < from || event.block_height > to {
                continue;
            }
            if self.is_final(event.block_height, head) {
                finalized.push(event);
            } else {
                self.pending.entry(event.block_height).or_default().push(event);
            }
        }

        let final_height = head.saturating_sub(self.depth);
        let checkpoint = std::cmp::max(self.checkpoint, std::cmp::min(to, final_height));
        self.checkpoint = checkpoint;

        debug!(
            "{} scan {}..={} at head {}: {} final, {} buffered, {} retracted, checkpoint {}",
            self.chain,
            from,
            to,
            head,
            finalized.len(),
            self.pending_len(),
            retracted.len(),
            checkpoint
        );

        ScanOutcome {
            finalized,
            retracted,
            checkpoint,
        }
    }
}
