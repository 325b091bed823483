//! Checkpointed event watching with finality buffering

use crate::config::ChainConfig;
use crate::error::RelayerResult;
use crate::events::ChainEvent;
use crate::state::SwapStore;

use super::finality::FinalityBuffer;
use super::{Chain, ChainAdapter};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Polling settings for one chain
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    pub max_block_range: u64,
    /// First block to scan when no checkpoint exists
    pub start_block: Option<u64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_block_range: 500,
            start_block: None,
        }
    }
}

impl WatchConfig {
    pub fn from_chain(config: &ChainConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_block_range: config.max_block_range.max(1),
            start_block: config.start_block,
        }
    }
}

/// One poll worth of watcher output
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub chain: Chain,
    pub head: u64,
    /// Final events, in height order
    pub events: Vec<ChainEvent>,
    /// Previously buffered events that were orphaned
    pub retractions: Vec<ChainEvent>,
    /// Height to persist once `events` have been handled
    pub checkpoint: u64,
}

/// Consumer of final chain events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Apply a batch of final events in order. Returns once every event has
    /// been handled; an error leaves the checkpoint where it was.
    async fn deliver(&self, events: Vec<ChainEvent>) -> RelayerResult<()>;
}

struct WatchState {
    adapter: Arc<dyn ChainAdapter>,
    buffer: FinalityBuffer,
    config: WatchConfig,
    first_poll: bool,
}

impl WatchState {
    /// Scan the next window; `None` when nothing changed
    async fn poll(&mut self) -> RelayerResult<Option<WatchBatch>> {
        let chain = self.adapter.chain();
        let head = self.adapter.latest_height().await?;
        crate::metrics::record_block_height(chain, head);

        let from = self.buffer.scan_start();
        if head < from {
            return Ok(None);
        }
        let to = std::cmp::min(head, from.saturating_add(self.config.max_block_range - 1));

        debug!("{}: scanning blocks {} to {} (head {})", chain, from, to, head);
        let events = self.adapter.fetch_events(from, to).await?;

        let previous = self.buffer.checkpoint();
        let outcome = self.buffer.apply(from, to, head, events);

        if outcome.finalized.is_empty()
            && outcome.retracted.is_empty()
            && outcome.checkpoint == previous
        {
            return Ok(None);
        }

        Ok(Some(WatchBatch {
            chain,
            head,
            events: outcome.finalized,
            retractions: outcome.retracted,
            checkpoint: outcome.checkpoint,
        }))
    }
}

/// Lazy, infinite stream of batches starting at `from_block`.
///
/// RPC failures are logged and retried on the next poll; the stream only ends
/// when dropped. Restarting from a persisted checkpoint replays anything that
/// was not acknowledged.
pub fn watch_events(
    adapter: Arc<dyn ChainAdapter>,
    from_block: u64,
    config: WatchConfig,
) -> impl Stream<Item = WatchBatch> + Send {
    let depth = adapter.finality_depth();
    let state = WatchState {
        buffer: FinalityBuffer::new(adapter.chain(), depth, from_block.saturating_sub(1)),
        adapter,
        config,
        first_poll: true,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if !state.first_poll {
                tokio::time::sleep(state.config.poll_interval).await;
            }
            state.first_poll = false;

            match state.poll().await {
                Ok(Some(batch)) => return Some((batch, state)),
                Ok(None) => continue,
                Err(e) => {
                    let chain = state.adapter.chain();
                    warn!("{}: poll failed: {}", chain, e);
                    crate::metrics::record_watch_error(chain);
                }
            }
        }
    })
}

/// Drives one chain's stream into the coordinator and persists checkpoints
pub struct EventWatcher {
    adapter: Arc<dyn ChainAdapter>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn SwapStore>,
    config: WatchConfig,
}

impl EventWatcher {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn SwapStore>,
        config: WatchConfig,
    ) -> Self {
        Self {
            adapter,
            sink,
            store,
            config,
        }
    }

    /// First height to scan: after the stored checkpoint, else the configured
    /// start block, else the current final height
    async fn resume_from(&self) -> RelayerResult<u64> {
        let chain = self.adapter.chain();
        if let Some(checkpoint) = self.store.get_checkpoint(chain).await? {
            return Ok(checkpoint + 1);
        }
        if let Some(start) = self.config.start_block {
            return Ok(start);
        }
        let head = self.adapter.latest_height().await?;
        Ok(head.saturating_sub(self.adapter.finality_depth()) + 1)
    }

    /// Watch until the shutdown flag is set
    pub async fn run(&self, shutdown: Arc<RwLock<bool>>) -> RelayerResult<()> {
        let chain = self.adapter.chain();
        let from = self.resume_from().await?;
        info!("Watching {} from block {}", chain, from);

        let mut batches = Box::pin(watch_events(
            self.adapter.clone(),
            from,
            self.config.clone(),
        ));
        let mut ticker = tokio::time::interval(Duration::from_millis(500));

        loop {
            let batch = tokio::select! {
                batch = batches.next() => batch,
                _ = ticker.tick() => {
                    if *shutdown.read().await {
                        info!("{} watcher stopping", chain);
                        return Ok(());
                    }
                    continue;
                }
            };

            let Some(batch) = batch else {
                return Ok(());
            };
            self.handle(batch).await?;
        }
    }

    /// Deliver one batch, then persist its checkpoint
    pub async fn handle(&self, batch: WatchBatch) -> RelayerResult<()> {
        for retracted in &batch.retractions {
            warn!(
                "{}: retracted {} for {} (tx {}, height {})",
                batch.chain,
                retracted.kind,
                retracted.escrow_ref,
                retracted.tx_ref,
                retracted.block_height
            );
            crate::metrics::record_retraction(batch.chain);
        }

        for event in &batch.events {
            crate::metrics::record_event(batch.chain, event.name());
        }

        if !batch.events.is_empty() {
            self.sink.deliver(batch.events).await?;
        }

        self.store.save_checkpoint(batch.chain, batch.checkpoint).await?;
        crate::metrics::record_checkpoint(batch.chain, batch.checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::SimulatedChain;
    use crate::chain::EscrowRef;
    use crate::events::EventKind;
    use crate::state::MemoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<ChainEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, events: Vec<ChainEvent>) -> RelayerResult<()> {
            self.delivered.lock().await.extend(events);
            Ok(())
        }
    }

    fn fast() -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_millis(1),
            max_block_range: 100,
            start_block: None,
        }
    }

    fn created(chain: Chain, escrow: &str, height: u64) -> ChainEvent {
        ChainEvent {
            chain,
            escrow_ref: EscrowRef::new(escrow),
            kind: EventKind::EscrowCreated,
            block_height: height,
            tx_ref: format!("tx-{}", escrow),
            amount: Some("1".into()),
            hashlock: None,
            secret: None,
        }
    }

    #[tokio::test]
    async fn stream_releases_events_after_depth() {
        let sim = Arc::new(SimulatedChain::new(Chain::Near, 3));
        sim.set_head(10);
        sim.push_event(created(Chain::Near, "a", 9));

        let mut batches = Box::pin(watch_events(sim.clone(), 1, fast()));

        // Head 10, depth 3: blocks up to 7 are final, the event at 9 is held
        let first = batches.next().await.unwrap();
        assert!(first.events.is_empty());
        assert_eq!(first.checkpoint, 7);

        sim.set_head(12);
        let second = batches.next().await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.checkpoint, 9);
    }

    #[tokio::test]
    async fn stream_survives_rpc_failures() {
        let sim = Arc::new(SimulatedChain::new(Chain::Tron, 0));
        sim.set_head(5);
        sim.fail_next_calls(2);

        let mut batches = Box::pin(watch_events(sim.clone(), 1, fast()));
        let batch = batches.next().await.unwrap();
        assert_eq!(batch.checkpoint, 5);
    }

    #[tokio::test]
    async fn stream_reports_orphaned_events() {
        let sim = Arc::new(SimulatedChain::new(Chain::Ethereum, 5));
        sim.set_head(10);
        sim.push_event(created(Chain::Ethereum, "x", 9));

        let mut batches = Box::pin(watch_events(sim.clone(), 1, fast()));
        let first = batches.next().await.unwrap();
        assert!(first.retractions.is_empty());

        sim.remove_events_at(9);
        sim.set_head(11);
        let second = batches.next().await.unwrap();
        assert_eq!(second.retractions.len(), 1);
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn watcher_persists_checkpoint_after_delivery() {
        let sim = Arc::new(SimulatedChain::new(Chain::Ethereum, 0));
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryStore::new());
        let watcher = EventWatcher::new(sim.clone(), sink.clone(), store.clone(), fast());

        watcher
            .handle(WatchBatch {
                chain: Chain::Ethereum,
                head: 20,
                events: vec![created(Chain::Ethereum, "e", 15)],
                retractions: vec![],
                checkpoint: 20,
            })
            .await
            .unwrap();

        assert_eq!(sink.delivered.lock().await.len(), 1);
        assert_eq!(store.get_checkpoint(Chain::Ethereum).await.unwrap(), Some(20));
        assert_eq!(watcher.resume_from().await.unwrap(), 21);
    }

    #[tokio::test]
    async fn watcher_resumes_from_start_block_without_checkpoint() {
        let sim = Arc::new(SimulatedChain::new(Chain::Near, 3));
        sim.set_head(100);
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());

        let watcher = EventWatcher::new(
            sim.clone(),
            sink.clone(),
            store.clone(),
            WatchConfig {
                start_block: Some(42),
                ..fast()
            },
        );
        assert_eq!(watcher.resume_from().await.unwrap(), 42);

        let watcher = EventWatcher::new(sim, sink, store, fast());
        assert_eq!(watcher.resume_from().await.unwrap(), 98);
    }
}
