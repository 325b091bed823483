//! Per-swap command lanes
//!
//! Every swap gets one unbounded FIFO queue drained by a single worker task,
//! so commands for the same swap never interleave while different swaps run
//! in parallel. A worker closes its queue when the swap is terminal; the next
//! command for that swap opens a fresh lane.

use super::swap::SwapId;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub struct Lanes<C> {
    lanes: DashMap<SwapId, UnboundedSender<C>>,
}

impl<C: Send + 'static> Default for Lanes<C> {
    fn default() -> Self {
        Self {
            lanes: DashMap::new(),
        }
    }
}

impl<C: Send + 'static> Lanes<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `cmd` on the swap's lane, starting a worker with `spawn` when
    /// the swap has no open lane
    pub fn send<F, Fut>(&self, id: &SwapId, cmd: C, spawn: F)
    where
        F: FnOnce(UnboundedReceiver<C>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.lanes.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let Err(SendError(cmd)) = entry.get().send(cmd) else {
                    return;
                };
                debug!("Reopening lane for swap {}", id);
                let (tx, rx) = mpsc::unbounded_channel();
                // The receiver is alive, so this cannot fail
                let _ = tx.send(cmd);
                entry.insert(tx);
                tokio::spawn(spawn(rx));
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(cmd);
                entry.insert(tx);
                tokio::spawn(spawn(rx));
            }
        }
    }

    /// Drop the lane entry once its worker has closed the queue
    pub fn retire(&self, id: &SwapId) {
        self.lanes.remove_if(id, |_, tx| tx.is_closed());
    }

    pub fn open_lanes(&self) -> usize {
        self.lanes.len()
    }
}
