//! Swap coordinator: drives every swap through its state machine

use super::lanes::Lanes;
use super::swap::{BridgeRequest, Leg, Swap, SwapId, SwapState, SwapTicket, Transition};
use crate::chain::{units, Chain, ChainAdapter, ChainManager, EscrowParams, EventSink, Settlement, TxRef};
use crate::config::TimelockConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, DedupeKey, EventKind};
use crate::oracle::PriceOracle;
use crate::secret::{verify, Secret};
use crate::state::SwapStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Work queued on a swap's lane
enum Command {
    /// Lock the source escrow of a swap that has none yet
    LockSource,
    Event(ChainEvent, oneshot::Sender<RelayerResult<()>>),
    Tick(DateTime<Utc>, oneshot::Sender<()>),
    Refund(oneshot::Sender<RelayerResult<Swap>>),
}

impl Command {
    fn fail(self, err: RelayerError) {
        match self {
            Command::LockSource => error!("Cannot lock source escrow: {}", err),
            Command::Event(_, reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Tick(_, reply) => {
                warn!("Sweep skipped a swap: {}", err);
                let _ = reply.send(());
            }
            Command::Refund(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub timelocks: TimelockConfig,
    pub sweep_interval: Duration,
    pub dedupe_window: Duration,
}

struct CoordinatorCore {
    chains: Arc<ChainManager>,
    store: Arc<dyn SwapStore>,
    oracle: Arc<dyn PriceOracle>,
    config: CoordinatorConfig,
    lanes: Lanes<Command>,
    /// Recently applied events
    seen: DashMap<DedupeKey, Instant>,
    /// Secrets already public, held in memory only
    revealed: DashMap<SwapId, Secret>,
    clock: Clock,
}

/// Cross-chain swap coordinator
pub struct SwapCoordinator {
    core: Arc<CoordinatorCore>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapCoordinator {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn SwapStore>,
        oracle: Arc<dyn PriceOracle>,
        config: CoordinatorConfig,
    ) -> Self {
        Self::with_clock(chains, store, oracle, config, system_clock())
    }

    pub fn with_clock(
        chains: Arc<ChainManager>,
        store: Arc<dyn SwapStore>,
        oracle: Arc<dyn PriceOracle>,
        config: CoordinatorConfig,
        clock: Clock,
    ) -> Self {
        Self {
            core: Arc::new(CoordinatorCore {
                chains,
                store,
                oracle,
                config,
                lanes: Lanes::new(),
                seen: DashMap::new(),
                revealed: DashMap::new(),
                clock,
            }),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Accept a bridge request: validate, quote, persist, then lock the
    /// source escrow in the background
    pub async fn create_swap(&self, request: BridgeRequest) -> RelayerResult<SwapTicket> {
        let core = &self.core;
        if request.source_chain == request.dest_chain {
            return Err(RelayerError::InvalidRequest(
                "source and destination chains must differ".into(),
            ));
        }
        let source = core.adapter(request.source_chain)?;
        let dest = core.adapter(request.dest_chain)?;

        units::to_exact_base_units(&request.amount, request.source_chain.decimals())?;
        if !source.is_valid_address(&request.initiator_address) {
            return Err(RelayerError::InvalidAddress {
                chain: request.source_chain,
                address: request.initiator_address,
            });
        }
        if !dest.is_valid_address(&request.beneficiary_address) {
            return Err(RelayerError::InvalidAddress {
                chain: request.dest_chain,
                address: request.beneficiary_address,
            });
        }

        let dest_amount = core
            .oracle
            .quote(&request.amount, request.source_chain, request.dest_chain)
            .await?;

        ensure_balance(source.as_ref(), &request.amount).await?;
        ensure_balance(dest.as_ref(), &dest_amount).await?;

        let secret = Secret::generate()?;
        let now = (core.clock)();
        let timelock_source = now + secs(core.config.timelocks.source_secs);
        let timelock_dest = now + secs(core.config.timelocks.dest_secs);
        let margin = secs(core.config.timelocks.safety_margin_secs);
        if timelock_source <= timelock_dest || timelock_source - timelock_dest < margin {
            return Err(RelayerError::Config(format!(
                "source timelock must exceed destination timelock by at least {}s",
                core.config.timelocks.safety_margin_secs
            )));
        }

        let swap = Swap::new(
            request.source_chain,
            request.dest_chain,
            request.initiator_address,
            request.beneficiary_address,
            request.amount,
            dest_amount,
            secret,
            timelock_source,
            timelock_dest,
            now,
        );
        core.store.insert_swap(&swap, &swap.created_transition()).await?;
        crate::metrics::record_swap_created(swap.source_chain, swap.dest_chain);

        info!(
            "Swap {} created: {} {} -> {} {} (hashlock {})",
            swap.id, swap.amount, swap.source_chain, swap.dest_amount, swap.dest_chain, swap.hashlock
        );

        core.dispatch(&swap.id, Command::LockSource);
        Ok(SwapTicket::from(&swap))
    }

    /// Current record and transition log
    pub async fn status(&self, id: &SwapId) -> RelayerResult<(Swap, Vec<Transition>)> {
        let swap = self
            .core
            .store
            .get_swap(id)
            .await?
            .ok_or_else(|| RelayerError::SwapNotFound(id.to_string()))?;
        let transitions = self.core.store.transitions(id).await?;
        Ok((swap, transitions))
    }

    /// Record a user refund request and attempt the refund now
    pub async fn request_refund(&self, id: &SwapId) -> RelayerResult<Swap> {
        if self.core.store.get_swap(id).await?.is_none() {
            return Err(RelayerError::SwapNotFound(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.core.dispatch(id, Command::Refund(tx));
        match rx.await {
            Ok(result) => result,
            // Lane retired under us: the swap is terminal
            Err(_) => self.status(id).await.map(|(swap, _)| swap),
        }
    }

    /// Retry stalled progress on every active swap as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> RelayerResult<usize> {
        let core = &self.core;
        let window = core.config.dedupe_window;
        core.seen.retain(|_, at| at.elapsed() < window);

        let active = core.store.list_active().await?;
        let mut replies = Vec::with_capacity(active.len());
        for swap in &active {
            let (tx, rx) = oneshot::channel();
            core.dispatch(&swap.id, Command::Tick(now, tx));
            replies.push(rx);
        }
        for rx in replies {
            let _ = rx.await;
        }
        Ok(active.len())
    }

    /// Pick up swaps that survived a restart. Unlocked swaps get their
    /// source lock retried; the sweep loop drives everything else.
    pub async fn recover(&self) -> RelayerResult<usize> {
        let active = self.core.store.list_active().await?;
        for swap in &active {
            info!(
                "Recovered swap {} in state {} ({} -> {})",
                swap.id, swap.state, swap.source_chain, swap.dest_chain
            );
            if swap.state == SwapState::Created && swap.source_escrow_ref.is_none() {
                self.core.dispatch(&swap.id, Command::LockSource);
            }
        }
        Ok(active.len())
    }

    /// Periodic sweep loop
    pub async fn run(&self) -> RelayerResult<()> {
        let recovered = self.recover().await?;
        info!("Swap coordinator started with {} active swaps", recovered);

        let mut ticker = interval(self.core.config.sweep_interval);
        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            let now = (self.core.clock)();
            match self.sweep(now).await {
                Ok(n) if n > 0 => debug!("Swept {} active swaps", n),
                Ok(_) => {}
                Err(e) => error!("Sweep failed: {}", e),
            }
        }

        info!("Swap coordinator stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

#[async_trait]
impl EventSink for SwapCoordinator {
    async fn deliver(&self, events: Vec<ChainEvent>) -> RelayerResult<()> {
        let core = &self.core;
        let mut pending = Vec::new();

        for event in events {
            let key = event.dedupe_key();
            if let Err(e) = core.check_fresh(&key) {
                debug!("Discarding event on {}: {}", event.chain, e);
                crate::metrics::record_duplicate_event(event.chain);
                continue;
            }

            let Some(id) = core.route(&event).await? else {
                debug!(
                    "No swap for {} {} on {}",
                    event.kind, event.escrow_ref, event.chain
                );
                continue;
            };

            let (tx, rx) = oneshot::channel();
            core.dispatch(&id, Command::Event(event, tx));
            pending.push((key, rx));
        }

        let mut first_error = None;
        for (key, rx) in pending {
            match rx.await {
                Ok(Ok(())) | Err(_) => {
                    core.seen.insert(key, Instant::now());
                }
                Ok(Err(e)) => {
                    error!("Event for {} failed: {}", key.escrow_ref, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn secs(s: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000))
}

/// Fail with `InsufficientBalance` when the adapter's signer cannot fund `need`
async fn ensure_balance(adapter: &dyn ChainAdapter, need: &str) -> RelayerResult<()> {
    let have = adapter.get_balance(&adapter.signer_address()).await?;
    if units::compare(&have, need)? == Ordering::Less {
        return Err(RelayerError::InsufficientBalance {
            chain: adapter.chain(),
            have,
            need: need.to_string(),
        });
    }
    Ok(())
}

async fn run_lane(core: Arc<CoordinatorCore>, id: SwapId, mut rx: UnboundedReceiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        if core.apply(&id, cmd).await {
            // Answer whatever is still queued, then retire the lane
            rx.close();
            while let Ok(cmd) = rx.try_recv() {
                core.apply(&id, cmd).await;
            }
            core.lanes.retire(&id);
            debug!("Lane for swap {} retired", id);
            break;
        }
    }
}

impl CoordinatorCore {
    fn adapter(&self, chain: Chain) -> RelayerResult<Arc<dyn ChainAdapter>> {
        self.chains.get_adapter(chain)
    }

    fn dispatch(self: &Arc<Self>, id: &SwapId, cmd: Command) {
        let core = self.clone();
        let lane_id = id.clone();
        self.lanes
            .send(id, cmd, move |rx| run_lane(core, lane_id, rx));
    }

    /// Reject events already applied within the dedupe window
    fn check_fresh(&self, key: &DedupeKey) -> RelayerResult<()> {
        let seen = self
            .seen
            .get(key)
            .map(|at| at.elapsed() < self.config.dedupe_window)
            .unwrap_or(false);
        if seen {
            return Err(RelayerError::DuplicateEvent {
                escrow_ref: key.escrow_ref.to_string(),
                kind: key.kind,
            });
        }
        Ok(())
    }

    /// Find the swap an event belongs to, by escrow reference first and by
    /// hashlock for escrows whose reference is not recorded yet
    async fn route(&self, event: &ChainEvent) -> RelayerResult<Option<SwapId>> {
        if let Some(swap) = self.store.find_by_escrow(event.chain, &event.escrow_ref).await? {
            return Ok(Some(swap.id));
        }
        let Some(hashlock) = &event.hashlock else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_by_hashlock(hashlock)
            .await?
            .filter(|swap| swap.leg_for(event.chain).is_some())
            .map(|swap| swap.id))
    }

    /// Apply one command; returns true once the swap is terminal
    async fn apply(&self, id: &SwapId, cmd: Command) -> bool {
        let mut swap = match self.store.get_swap(id).await {
            Ok(Some(mut swap)) => {
                if swap.secret.is_none() {
                    swap.secret = self.revealed.get(id).map(|s| s.value().clone());
                }
                swap
            }
            Ok(None) => {
                cmd.fail(RelayerError::SwapNotFound(id.to_string()));
                return true;
            }
            Err(e) => {
                cmd.fail(e);
                return false;
            }
        };

        match cmd {
            Command::LockSource => {
                if let Err(e) = self.lock_source(&mut swap).await {
                    error!("Swap {}: locking source escrow failed: {}", swap.id, e);
                }
            }
            Command::Event(event, reply) => {
                let _ = reply.send(self.on_event(&mut swap, event).await);
            }
            Command::Tick(now, reply) => {
                if let Err(e) = self.on_tick(&mut swap, now).await {
                    warn!("Swap {}: sweep step failed: {}", swap.id, e);
                }
                let _ = reply.send(());
            }
            Command::Refund(reply) => {
                let result = self.on_refund_request(&mut swap).await.map(|_| swap.clone());
                let _ = reply.send(result);
            }
        }

        swap.is_terminal()
    }

    /// Persist `swap`, moving it to `next` when given
    async fn commit(
        &self,
        swap: &mut Swap,
        next: Option<(SwapState, String)>,
        now: DateTime<Utc>,
    ) -> RelayerResult<()> {
        let transition = match next {
            Some((state, reason)) => Some(swap.transition(state, reason, now)?),
            None => {
                swap.updated_at = now;
                None
            }
        };
        self.store.update_swap(swap, transition.as_ref()).await?;

        if swap.is_terminal() {
            self.revealed.remove(&swap.id);
        } else if let (None, Some(secret)) = (swap.storable_secret(), &swap.secret) {
            self.revealed.insert(swap.id.clone(), secret.clone());
        }

        if let Some(t) = transition {
            let from = t.from_state.map(|s| s.as_str()).unwrap_or("none");
            info!("Swap {}: {} -> {} ({})", swap.id, from, t.to_state, t.reason);
            crate::metrics::record_swap_transition(from, t.to_state.as_str());
        }
        Ok(())
    }

    /// Remember an adapter failure for status queries
    async fn record_error(&self, swap: &mut Swap, err: &RelayerError) -> RelayerResult<()> {
        if err.should_alert() {
            error!("Swap {}: {}", swap.id, err);
        } else {
            warn!("Swap {}: {}", swap.id, err);
        }
        swap.last_error = Some(err.to_string());
        self.commit(swap, None, (self.clock)()).await
    }

    async fn lock_source(&self, swap: &mut Swap) -> RelayerResult<()> {
        if swap.state != SwapState::Created || swap.source_escrow_ref.is_some() {
            return Ok(());
        }
        if swap.refund_requested || (self.clock)() >= swap.timelock_dest {
            debug!("Swap {}: not locking the source escrow", swap.id);
            return Ok(());
        }
        let source = self.adapter(swap.source_chain)?;
        let params = EscrowParams {
            hashlock: swap.hashlock,
            beneficiary: source.signer_address(),
            amount: swap.amount.clone(),
            timelock: swap.timelock_source,
        };

        match source.create_escrow(&params).await {
            Ok(escrow) => {
                info!("Swap {}: source escrow {} submitted", swap.id, escrow);
                swap.source_escrow_ref = Some(escrow);
                swap.last_error = None;
                self.commit(swap, None, (self.clock)()).await
            }
            Err(e) if e.is_permanent() => {
                swap.last_error = Some(e.to_string());
                self.commit(
                    swap,
                    Some((SwapState::Failed, format!("source escrow rejected: {}", e))),
                    (self.clock)(),
                )
                .await
            }
            Err(e) => self.record_error(swap, &e).await,
        }
    }

    async fn on_event(&self, swap: &mut Swap, event: ChainEvent) -> RelayerResult<()> {
        if swap.is_terminal() {
            return Ok(());
        }
        let Some(leg) = swap.leg_for(event.chain) else {
            return Ok(());
        };

        if !self.claim_escrow(swap, leg, &event) {
            warn!(
                "Swap {}: ignoring {} for foreign escrow {} on {}",
                swap.id, event.kind, event.escrow_ref, event.chain
            );
            return Ok(());
        }

        let now = (self.clock)();
        match (leg, event.kind) {
            (Leg::Source, EventKind::EscrowCreated) => {
                if swap.state != SwapState::Created {
                    return Ok(());
                }
                self.commit(
                    swap,
                    Some((
                        SwapState::SourceLocked,
                        format!("source escrow final at height {}", event.block_height),
                    )),
                    now,
                )
                .await?;
                self.create_dest(swap, now).await
            }
            (Leg::Dest, EventKind::EscrowCreated) => {
                if swap.dest_confirmed {
                    return Ok(());
                }
                swap.dest_confirmed = true;
                if swap.state == SwapState::SourceLocked {
                    // Created by an earlier attempt whose reply was lost
                    self.commit(
                        swap,
                        Some((SwapState::DestLocked, "destination escrow observed".into())),
                        now,
                    )
                    .await?;
                } else {
                    self.commit(swap, None, now).await?;
                }
                self.reveal_secret(swap, now).await
            }
            (Leg::Dest, EventKind::Completed) => {
                let Some(secret) = event.secret.filter(|s| verify(s, &swap.hashlock)) else {
                    warn!("Swap {}: destination completion without a valid secret", swap.id);
                    return Ok(());
                };
                if swap.secret.is_none() {
                    swap.secret = Some(secret);
                }
                if swap.dest_completed {
                    return self.complete_source(swap, now).await;
                }
                swap.dest_completed = true;
                if swap.state == SwapState::DestLocked {
                    self.commit(
                        swap,
                        Some((SwapState::SecretRevealed, "destination completed".into())),
                        now,
                    )
                    .await?;
                } else {
                    self.commit(swap, None, now).await?;
                }
                self.complete_source(swap, now).await
            }
            (Leg::Source, EventKind::Completed) => {
                if swap.state.can_transition_to(SwapState::Completed) {
                    self.commit(
                        swap,
                        Some((SwapState::Completed, "source completed".into())),
                        now,
                    )
                    .await?;
                }
                Ok(())
            }
            (Leg::Source, EventKind::Refunded) => {
                if swap.source_refund_tx.is_none() {
                    swap.source_refund_tx = Some(event.tx_ref);
                }
                self.finish_refund(swap, now).await
            }
            (Leg::Dest, EventKind::Refunded) => {
                if swap.dest_refund_tx.is_none() {
                    swap.dest_refund_tx = Some(event.tx_ref);
                }
                self.finish_refund(swap, now).await
            }
        }
    }

    /// Check the event's escrow is this swap's, adopting it when the swap
    /// has no reference for that leg yet
    fn claim_escrow(&self, swap: &mut Swap, leg: Leg, event: &ChainEvent) -> bool {
        if let Some(known) = swap.escrow_ref(leg) {
            return *known == event.escrow_ref;
        }
        if event.kind != EventKind::EscrowCreated || event.hashlock != Some(swap.hashlock) {
            return false;
        }
        let expected = match leg {
            Leg::Source => &swap.amount,
            Leg::Dest => &swap.dest_amount,
        };
        let amount_matches = event
            .amount
            .as_deref()
            .map(|a| units::compare(a, expected).ok() == Some(Ordering::Equal))
            .unwrap_or(false);
        if !amount_matches {
            return false;
        }
        match leg {
            Leg::Source => swap.source_escrow_ref = Some(event.escrow_ref.clone()),
            Leg::Dest => {
                // Only a swap waiting on its destination lock can adopt one
                if swap.state != SwapState::SourceLocked {
                    return false;
                }
                swap.dest_escrow_ref = Some(event.escrow_ref.clone());
            }
        }
        info!("Swap {}: adopted {:?} escrow {}", swap.id, leg, event.escrow_ref);
        true
    }

    /// Lock the mirrored escrow on the destination chain
    async fn create_dest(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        if swap.state != SwapState::SourceLocked || swap.dest_escrow_ref.is_some() {
            return Ok(());
        }
        if swap.refund_requested {
            debug!("Swap {}: refund requested, not locking the destination", swap.id);
            return Ok(());
        }
        if now >= swap.timelock_dest {
            debug!("Swap {}: destination window closed, waiting for refund", swap.id);
            return Ok(());
        }

        let dest = self.adapter(swap.dest_chain)?;
        let params = EscrowParams {
            hashlock: swap.hashlock,
            beneficiary: swap.beneficiary.clone(),
            amount: swap.dest_amount.clone(),
            timelock: swap.timelock_dest,
        };

        match dest.create_escrow(&params).await {
            Ok(escrow) => {
                swap.dest_escrow_ref = Some(escrow.clone());
                swap.last_error = None;
                self.commit(
                    swap,
                    Some((SwapState::DestLocked, format!("destination escrow {}", escrow))),
                    (self.clock)(),
                )
                .await
            }
            // Retried by the sweep until the destination window closes
            Err(e) => self.record_error(swap, &e).await,
        }
    }

    /// Complete the destination escrow, publishing the secret
    async fn reveal_secret(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        if swap.state != SwapState::DestLocked || !swap.dest_confirmed || swap.refund_requested {
            return Ok(());
        }
        if now >= swap.timelock_dest {
            if swap.last_error.is_none() {
                swap.last_error =
                    Some("destination escrow confirmed after its timelock; awaiting refund".into());
                self.commit(swap, None, now).await?;
            }
            return Ok(());
        }
        let (Some(escrow), Some(secret)) = (swap.dest_escrow_ref.clone(), swap.secret.clone())
        else {
            return Ok(());
        };

        let dest = self.adapter(swap.dest_chain)?;
        match dest.complete_escrow(&escrow, &secret).await {
            Ok(TxRef::Submitted(_)) | Ok(TxRef::AlreadySettled(Settlement::Completed)) => {
                swap.last_error = None;
                self.commit(
                    swap,
                    Some((SwapState::SecretRevealed, "secret revealed on destination".into())),
                    (self.clock)(),
                )
                .await
            }
            Ok(TxRef::AlreadySettled(Settlement::Refunded)) => {
                swap.dest_refund_tx = Some(TxRef::AlreadySettled(Settlement::Refunded).to_string());
                let err = RelayerError::ChainRejection {
                    chain: swap.dest_chain,
                    reason: "destination escrow already refunded".into(),
                };
                self.record_error(swap, &err).await
            }
            Err(e) => self.record_error(swap, &e).await,
        }
    }

    /// Claim the source escrow with the now-public secret
    async fn complete_source(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        if swap.state != SwapState::SecretRevealed || !swap.dest_completed {
            return Ok(());
        }
        let Some(escrow) = swap.source_escrow_ref.clone() else {
            return Ok(());
        };
        let secret = match swap.secret.clone() {
            Some(secret) => secret,
            None => match self.recover_secret(swap).await? {
                Some(secret) => secret,
                None => {
                    warn!("Swap {}: secret not recoverable yet, source claim waits", swap.id);
                    return Ok(());
                }
            },
        };

        let source = self.adapter(swap.source_chain)?;
        match source.complete_escrow(&escrow, &secret).await {
            Ok(TxRef::Submitted(tx)) => {
                self.commit(
                    swap,
                    Some((SwapState::Completed, format!("source completed in {}", tx))),
                    now,
                )
                .await
            }
            Ok(TxRef::AlreadySettled(Settlement::Completed)) => {
                self.commit(
                    swap,
                    Some((SwapState::Completed, "source already completed".into())),
                    now,
                )
                .await
            }
            Ok(TxRef::AlreadySettled(Settlement::Refunded)) => {
                swap.source_refund_tx =
                    Some(TxRef::AlreadySettled(Settlement::Refunded).to_string());
                self.commit(
                    swap,
                    Some((SwapState::Refunded, "source already refunded".into())),
                    now,
                )
                .await
            }
            Err(e) => self.record_error(swap, &e).await,
        }
    }

    /// Read the published secret back from the destination escrow
    async fn recover_secret(&self, swap: &mut Swap) -> RelayerResult<Option<Secret>> {
        let Some(escrow) = swap.dest_escrow_ref.clone() else {
            return Ok(None);
        };
        let dest = self.adapter(swap.dest_chain)?;
        let secret = dest
            .revealed_secret(&escrow)
            .await?
            .filter(|s| verify(s, &swap.hashlock));
        if let Some(secret) = &secret {
            info!("Swap {}: recovered secret from {} escrow {}", swap.id, swap.dest_chain, escrow);
            swap.secret = Some(secret.clone());
            self.revealed.insert(swap.id.clone(), secret.clone());
        }
        Ok(secret)
    }

    async fn on_tick(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        if swap.is_terminal() {
            return Ok(());
        }

        match swap.state {
            SwapState::Created if swap.source_escrow_ref.is_none() => {
                if now >= swap.timelock_source {
                    return self
                        .commit(
                            swap,
                            Some((
                                SwapState::Failed,
                                "source escrow never observed before its timelock".into(),
                            )),
                            now,
                        )
                        .await;
                }
                return self.lock_source(swap).await;
            }
            SwapState::SourceLocked => self.create_dest(swap, now).await?,
            SwapState::DestLocked => self.reveal_secret(swap, now).await?,
            SwapState::SecretRevealed => self.complete_source(swap, now).await?,
            _ => {}
        }

        if !swap.is_terminal()
            && !swap.dest_completed
            && (now >= swap.timelock_source || swap.refund_requested)
        {
            self.refund(swap, now).await?;
        }
        Ok(())
    }

    async fn on_refund_request(&self, swap: &mut Swap) -> RelayerResult<()> {
        if swap.is_terminal() {
            return Ok(());
        }
        let now = (self.clock)();
        if !swap.refund_requested {
            swap.refund_requested = true;
            self.commit(swap, None, now).await?;
        }
        if swap.dest_completed {
            // Secret is public: only completion is safe
            return self.complete_source(swap, now).await;
        }
        self.refund(swap, now).await
    }

    /// Refund each locked leg that has not been refunded yet, destination
    /// first. The chain decides whether a timelock has expired.
    async fn refund(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        for leg in [Leg::Dest, Leg::Source] {
            let (escrow, done) = match leg {
                Leg::Dest => (swap.dest_escrow_ref.clone(), swap.dest_refund_tx.is_some()),
                Leg::Source => (swap.source_escrow_ref.clone(), swap.source_refund_tx.is_some()),
            };
            let Some(escrow) = escrow else {
                continue;
            };
            if done {
                continue;
            }

            let chain = match leg {
                Leg::Dest => swap.dest_chain,
                Leg::Source => swap.source_chain,
            };
            let adapter = self.adapter(chain)?;

            let tx = match adapter.refund_escrow(&escrow).await {
                Ok(TxRef::Submitted(tx)) => {
                    crate::metrics::record_refund_attempt(chain, "submitted");
                    tx
                }
                Ok(settled @ TxRef::AlreadySettled(Settlement::Refunded)) => {
                    crate::metrics::record_refund_attempt(chain, "already_refunded");
                    settled.to_string()
                }
                Ok(TxRef::AlreadySettled(Settlement::Completed)) => {
                    crate::metrics::record_refund_attempt(chain, "already_completed");
                    return self.settled_by_completion(swap, leg, now).await;
                }
                Err(RelayerError::TimelockNotExpired { .. }) => {
                    crate::metrics::record_refund_attempt(chain, "too_early");
                    debug!("Swap {}: {} refund not yet possible", swap.id, chain);
                    return Ok(());
                }
                Err(e) if leg == Leg::Source && swap.state == SwapState::Created && e.is_permanent() => {
                    // Submitted but never mined: no funds to reclaim
                    crate::metrics::record_refund_attempt(chain, "not_found");
                    swap.last_error = Some(e.to_string());
                    return self
                        .commit(
                            swap,
                            Some((
                                SwapState::Failed,
                                "source escrow never observed before its timelock".into(),
                            )),
                            now,
                        )
                        .await;
                }
                Err(e) if leg == Leg::Dest && !swap.dest_confirmed && e.is_permanent() => {
                    // The destination lock never became final; nothing to reclaim
                    crate::metrics::record_refund_attempt(chain, "not_found");
                    warn!("Swap {}: destination escrow {} not refundable: {}", swap.id, escrow, e);
                    "not-locked".to_string()
                }
                Err(e) => {
                    crate::metrics::record_refund_attempt(chain, "error");
                    return self.record_error(swap, &e).await;
                }
            };

            match leg {
                Leg::Dest => swap.dest_refund_tx = Some(tx),
                Leg::Source => swap.source_refund_tx = Some(tx),
            }
            self.commit(swap, None, now).await?;
        }

        self.finish_refund(swap, now).await
    }

    /// Move to Refunded once every locked leg has been refunded
    async fn finish_refund(&self, swap: &mut Swap, now: DateTime<Utc>) -> RelayerResult<()> {
        let source_done = swap.source_escrow_ref.is_none() || swap.source_refund_tx.is_some();
        let dest_done = swap.dest_escrow_ref.is_none() || swap.dest_refund_tx.is_some();

        if !source_done || !dest_done || swap.source_refund_tx.is_none() {
            return self.commit(swap, None, now).await;
        }
        if !swap.state.can_transition_to(SwapState::Refunded) {
            return Ok(());
        }
        let reason = if swap.refund_requested {
            "refunded on request"
        } else {
            "timelock expired"
        };
        self.commit(swap, Some((SwapState::Refunded, reason.into())), now)
            .await
    }

    /// A refund found the escrow already completed
    async fn settled_by_completion(
        &self,
        swap: &mut Swap,
        leg: Leg,
        now: DateTime<Utc>,
    ) -> RelayerResult<()> {
        match leg {
            Leg::Source => {
                self.commit(
                    swap,
                    Some((SwapState::Completed, "source claimed with the secret".into())),
                    now,
                )
                .await
            }
            Leg::Dest => {
                swap.dest_completed = true;
                if swap.state == SwapState::DestLocked {
                    self.commit(
                        swap,
                        Some((SwapState::SecretRevealed, "destination already completed".into())),
                        now,
                    )
                    .await?;
                } else {
                    self.commit(swap, None, now).await?;
                }
                self.complete_source(swap, now).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::SimulatedChain;
    use crate::chain::WatchConfig;
    use crate::oracle::{FixedRateOracle, MockPriceOracle};
    use crate::state::MemoryStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Harness {
        coordinator: SwapCoordinator,
        chains: Arc<ChainManager>,
        store: Arc<MemoryStore>,
        eth: Arc<SimulatedChain>,
        near: Arc<SimulatedChain>,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            timelocks: TimelockConfig {
                source_secs: 7200,
                dest_secs: 3600,
                safety_margin_secs: 600,
            },
            sweep_interval: Duration::from_secs(1),
            dedupe_window: Duration::from_secs(60),
        }
    }

    fn fixed_oracle() -> Arc<dyn PriceOracle> {
        Arc::new(FixedRateOracle::new(HashMap::from([
            ("eth".to_string(), "3000".to_string()),
            ("trx".to_string(), "0.12".to_string()),
            ("near".to_string(), "5".to_string()),
        ])))
    }

    fn request(amount: &str) -> BridgeRequest {
        BridgeRequest {
            source_chain: Chain::Ethereum,
            dest_chain: Chain::Near,
            amount: amount.into(),
            initiator_address: "alice-eth".into(),
            beneficiary_address: "bob.near".into(),
        }
    }

    impl Harness {
        fn new(oracle: Arc<dyn PriceOracle>) -> Self {
            let eth = Arc::new(SimulatedChain::new(Chain::Ethereum, 12));
            let near = Arc::new(SimulatedChain::new(Chain::Near, 3));
            let chains = Arc::new(ChainManager::from_adapters(vec![
                (eth.clone() as Arc<dyn ChainAdapter>, WatchConfig::default()),
                (near.clone() as Arc<dyn ChainAdapter>, WatchConfig::default()),
            ]));
            let store = Arc::new(MemoryStore::new());
            let now = Arc::new(Mutex::new(Utc::now()));
            let coordinator = Self::coordinator(&chains, &store, oracle, &now);
            Self {
                coordinator,
                chains,
                store,
                eth,
                near,
                now,
            }
        }

        fn coordinator(
            chains: &Arc<ChainManager>,
            store: &Arc<MemoryStore>,
            oracle: Arc<dyn PriceOracle>,
            now: &Arc<Mutex<DateTime<Utc>>>,
        ) -> SwapCoordinator {
            let clock_now = now.clone();
            SwapCoordinator::with_clock(
                chains.clone(),
                store.clone(),
                oracle,
                config(),
                Arc::new(move || *clock_now.lock().unwrap()),
            )
        }

        /// Move every clock, the coordinator's and both chains', to `at`
        fn advance_to(&self, at: DateTime<Utc>) {
            *self.now.lock().unwrap() = at;
            self.eth.set_now(at);
            self.near.set_now(at);
        }

        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        /// Create a swap and wait for its source lock to be submitted
        async fn open(&self, amount: &str) -> SwapTicket {
            let ticket = self.coordinator.create_swap(request(amount)).await.unwrap();
            self.coordinator.sweep(self.now()).await.unwrap();
            ticket
        }

        async fn deliver_from(&self, sim: &SimulatedChain) {
            sim.finalize();
            self.coordinator.deliver(sim.events()).await.unwrap();
        }

        async fn swap(&self, id: &SwapId) -> Swap {
            self.store.get_swap(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn happy_path_completes_both_legs() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        assert_eq!(ticket.dest_amount, "600");

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Created);
        assert!(swap.source_escrow_ref.is_some());

        // Source lock final: destination escrow gets created
        h.deliver_from(&h.eth).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::DestLocked);
        let dest_ref = swap.dest_escrow_ref.clone().unwrap();
        let dest = h.near.escrow(&dest_ref).unwrap();
        assert_eq!(dest.params.beneficiary, "bob.near");
        assert_eq!(dest.params.amount, "600");
        assert_eq!(dest.params.timelock, ticket.timelock_dest);

        // Destination lock final: secret is revealed there
        h.deliver_from(&h.near).await;
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::SecretRevealed);

        // Destination completion final: source is claimed
        h.deliver_from(&h.near).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Completed);
        assert!(swap.secret.is_none());
        assert_eq!(h.eth.calls("complete"), 1);
        assert_eq!(h.near.calls("complete"), 1);

        let (_, transitions) = h.coordinator.status(&ticket.swap_id).await.unwrap();
        let states: Vec<SwapState> = transitions.iter().map(|t| t.to_state).collect();
        assert_eq!(
            states,
            vec![
                SwapState::Created,
                SwapState::SourceLocked,
                SwapState::DestLocked,
                SwapState::SecretRevealed,
                SwapState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn ticket_orders_timelocks_and_commits_to_secret() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.coordinator.create_swap(request("0.5")).await.unwrap();
        assert!(ticket.timelock_source > ticket.timelock_dest);

        let swap = h.swap(&ticket.swap_id).await;
        let secret = swap.secret.unwrap();
        assert!(verify(&secret, &ticket.hashlock));
    }

    #[tokio::test]
    async fn unconfirmed_destination_is_refunded_without_revealing() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::DestLocked);

        // Destination events never arrive
        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Refunded);
        assert!(swap.source_refund_tx.is_some());
        assert!(swap.dest_refund_tx.is_some());
        assert_eq!(h.near.calls("complete"), 0);
        assert_eq!(h.near.calls("refund"), 1);
        assert_eq!(h.eth.calls("refund"), 1);
    }

    #[tokio::test]
    async fn duplicate_events_do_not_repeat_side_effects() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;

        let created = h.eth.events();
        let doubled: Vec<ChainEvent> = created.iter().chain(created.iter()).cloned().collect();
        h.coordinator.deliver(doubled).await.unwrap();
        h.coordinator.deliver(created).await.unwrap();

        assert_eq!(h.near.calls("create"), 1);
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::DestLocked);
    }

    #[tokio::test]
    async fn late_destination_confirmation_is_not_completed() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;

        let late = ticket.timelock_dest + ChronoDuration::seconds(1);
        h.advance_to(late);
        h.deliver_from(&h.near).await;

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::DestLocked);
        assert!(swap.dest_confirmed);
        assert!(swap.last_error.is_some());
        assert_eq!(h.near.calls("complete"), 0);

        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::Refunded);
    }

    #[tokio::test]
    async fn oracle_outage_rejects_request() {
        let mut oracle = MockPriceOracle::new();
        oracle
            .expect_quote()
            .returning(|_, _, _| Err(RelayerError::OracleUnavailable("feed down".into())));
        let h = Harness::new(Arc::new(oracle));

        let err = tokio_test::assert_err!(h.coordinator.create_swap(request("1.0")).await);
        assert!(matches!(err, RelayerError::OracleUnavailable(_)));
        assert!(h.store.list_active().await.unwrap().is_empty());
        assert_eq!(h.eth.calls("create"), 0);
    }

    #[tokio::test]
    async fn destination_shortfall_is_insufficient_balance() {
        let h = Harness::new(fixed_oracle());
        h.near.set_balance("10");

        let err = h.coordinator.create_swap(request("1.0")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayerError::InsufficientBalance { chain: Chain::Near, .. }
        ));
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let h = Harness::new(fixed_oracle());

        let mut bad_address = request("1.0");
        bad_address.beneficiary_address = "bob near!".into();
        assert!(matches!(
            h.coordinator.create_swap(bad_address).await,
            Err(RelayerError::InvalidAddress { chain: Chain::Near, .. })
        ));

        let mut same_chain = request("1.0");
        same_chain.dest_chain = Chain::Ethereum;
        assert!(matches!(
            h.coordinator.create_swap(same_chain).await,
            Err(RelayerError::InvalidRequest(_))
        ));

        assert!(matches!(
            h.coordinator.create_swap(request("0")).await,
            Err(RelayerError::InvalidRequest(_))
        ));

        let mut unconfigured = request("1.0");
        unconfigured.dest_chain = Chain::Tron;
        assert!(matches!(
            h.coordinator.create_swap(unconfigured).await,
            Err(RelayerError::ChainNotFound(Chain::Tron))
        ));
    }

    #[tokio::test]
    async fn rejected_source_lock_fails_swap() {
        let h = Harness::new(fixed_oracle());
        h.eth.reject_creates("ERC20: insufficient allowance");
        let ticket = h.open("1.0").await;

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Failed);
        assert!(swap.secret.is_none());
        assert!(swap.last_error.is_some());
    }

    #[tokio::test]
    async fn vanished_source_escrow_fails_at_timelock() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        let source_ref = h.swap(&ticket.swap_id).await.source_escrow_ref.unwrap();

        // Pretend the lock transaction was dropped before being mined
        let mut swap = h.swap(&ticket.swap_id).await;
        swap.source_escrow_ref = Some(crate::chain::EscrowRef::new(format!("{}-dropped", source_ref)));
        h.store.update_swap(&swap, None).await.unwrap();

        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();

        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::Failed);
        assert_eq!(h.eth.calls("refund"), 0);
    }

    #[tokio::test]
    async fn transient_source_failure_is_retried_by_sweep() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.coordinator.create_swap(request("1.0")).await.unwrap();
        // The initial lock and the first sweep's retry both fail
        h.eth.fail_next_calls(2);
        h.coordinator.sweep(h.now()).await.unwrap();

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Created);
        assert!(swap.source_escrow_ref.is_none());
        assert!(swap.last_error.is_some());

        h.coordinator.sweep(h.now()).await.unwrap();
        let swap = h.swap(&ticket.swap_id).await;
        assert!(swap.source_escrow_ref.is_some());
        assert!(swap.last_error.is_none());
        assert_eq!(h.eth.calls("create"), 1);
    }

    #[tokio::test]
    async fn unlocked_swap_is_locked_after_restart() {
        let h = Harness::new(fixed_oracle());
        // Persisted, but the process died before the lock was queued
        let now = h.now();
        let swap = Swap::new(
            Chain::Ethereum,
            Chain::Near,
            "alice-eth".into(),
            "bob.near".into(),
            "1.0".into(),
            "600".into(),
            Secret::generate().unwrap(),
            now + ChronoDuration::hours(2),
            now + ChronoDuration::hours(1),
            now,
        );
        h.store.insert_swap(&swap, &swap.created_transition()).await.unwrap();

        let restarted = Harness::coordinator(&h.chains, &h.store, fixed_oracle(), &h.now);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        restarted.sweep(now).await.unwrap();

        let stored = h.swap(&swap.id).await;
        assert!(stored.source_escrow_ref.is_some());
        assert_eq!(h.eth.calls("create"), 1);

        h.eth.finalize();
        restarted.deliver(h.eth.events()).await.unwrap();
        assert_eq!(h.swap(&swap.id).await.state, SwapState::DestLocked);
    }

    #[tokio::test]
    async fn source_lock_is_not_retried_after_destination_window() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.coordinator.create_swap(request("1.0")).await.unwrap();
        h.eth.fail_next_calls(1);
        let late = ticket.timelock_dest + ChronoDuration::seconds(1);
        h.advance_to(late);
        h.coordinator.sweep(late).await.unwrap();
        assert_eq!(h.eth.calls("create"), 0);

        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::Failed);
    }

    #[tokio::test]
    async fn amounts_below_source_precision_are_rejected() {
        let h = Harness::new(fixed_oracle());
        for amount in ["0.0000000000000000001", "1.0000000000000000001"] {
            let err = tokio_test::assert_err!(h.coordinator.create_swap(request(amount)).await);
            assert!(matches!(err, RelayerError::InvalidRequest(_)));
        }
        assert!(h.store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refund_request_stops_destination_lock() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.near.fail_next_calls(1);
        h.deliver_from(&h.eth).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::SourceLocked);
        assert!(swap.last_error.is_some());

        h.coordinator.request_refund(&ticket.swap_id).await.unwrap();
        h.coordinator.sweep(h.now()).await.unwrap();
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::SourceLocked);
        assert!(swap.dest_escrow_ref.is_none());
        assert_eq!(h.near.calls("create"), 0);

        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Refunded);
        assert_eq!(h.eth.calls("refund"), 1);
        assert_eq!(h.near.calls("create"), 0);
    }

    #[tokio::test]
    async fn source_refund_losing_to_completion_settles_completed() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::DestLocked);

        // The source escrow is claimed before the refund lands
        let source_ref = swap.source_escrow_ref.clone().unwrap();
        h.eth.withdraw_externally(&source_ref, swap.secret.as_ref().unwrap());

        let expired = ticket.timelock_source + ChronoDuration::seconds(1);
        h.advance_to(expired);
        h.coordinator.sweep(expired).await.unwrap();

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Completed);
        assert!(swap.source_refund_tx.is_none());
        assert_eq!(h.eth.calls("refund"), 0);
    }

    #[tokio::test]
    async fn destination_refund_losing_to_completion_claims_source() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;
        let swap = h.swap(&ticket.swap_id).await;
        let dest_ref = swap.dest_escrow_ref.clone().unwrap();

        // The beneficiary withdraws on the destination while a refund is requested
        h.near.withdraw_externally(&dest_ref, swap.secret.as_ref().unwrap());
        h.coordinator.request_refund(&ticket.swap_id).await.unwrap();

        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::Completed);
        assert!(swap.dest_completed);
        assert_eq!(h.eth.calls("complete"), 1);
        assert_eq!(h.eth.calls("refund"), 0);
        assert_eq!(h.near.calls("refund"), 0);
    }

    #[tokio::test]
    async fn revealed_secret_is_not_stored_and_is_read_back_from_chain() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;
        h.deliver_from(&h.near).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::SecretRevealed);
        assert!(swap.secret.is_none());

        // Source claim fails once, then the process restarts
        h.eth.fail_next_calls(1);
        h.deliver_from(&h.near).await;
        let swap = h.swap(&ticket.swap_id).await;
        assert_eq!(swap.state, SwapState::SecretRevealed);
        assert!(swap.dest_completed);
        assert!(swap.secret.is_none());

        let restarted = Harness::coordinator(&h.chains, &h.store, fixed_oracle(), &h.now);
        restarted.sweep(h.now()).await.unwrap();
        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::Completed);
        assert_eq!(h.eth.calls("complete"), 1);
    }

    #[tokio::test]
    async fn early_refund_request_waits_for_timelock() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;
        h.deliver_from(&h.eth).await;

        let swap = h.coordinator.request_refund(&ticket.swap_id).await.unwrap();
        assert!(swap.refund_requested);
        assert_eq!(swap.state, SwapState::DestLocked);
        assert_eq!(h.near.calls("refund"), 0);

        // The request sticks: no reveal once a refund was asked for
        let after_dest = ticket.timelock_dest + ChronoDuration::seconds(1);
        h.advance_to(after_dest);
        h.coordinator.sweep(after_dest).await.unwrap();
        assert_eq!(h.near.calls("refund"), 1);
        assert_eq!(h.near.calls("complete"), 0);
    }

    #[tokio::test]
    async fn unknown_swap_refund_is_not_found() {
        let h = Harness::new(fixed_oracle());
        assert!(matches!(
            h.coordinator.request_refund(&SwapId::generate()).await,
            Err(RelayerError::SwapNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restarted_coordinator_resumes_from_store() {
        let h = Harness::new(fixed_oracle());
        let ticket = h.open("1.0").await;

        let restarted = Harness::coordinator(&h.chains, &h.store, fixed_oracle(), &h.now);
        assert_eq!(restarted.recover().await.unwrap(), 1);

        h.eth.finalize();
        restarted.deliver(h.eth.events()).await.unwrap();
        restarted.deliver(h.near.events()).await.unwrap();
        restarted.deliver(h.near.events()).await.unwrap();

        assert_eq!(h.swap(&ticket.swap_id).await.state, SwapState::Completed);
    }

    #[tokio::test]
    async fn events_for_unknown_escrows_are_ignored() {
        let h = Harness::new(fixed_oracle());
        let stray = ChainEvent {
            chain: Chain::Near,
            escrow_ref: crate::chain::EscrowRef::new("someone-else"),
            kind: EventKind::Refunded,
            block_height: 5,
            tx_ref: "tx".into(),
            amount: None,
            hashlock: None,
            secret: None,
        };
        tokio_test::assert_ok!(h.coordinator.deliver(vec![stray]).await);
    }
}
