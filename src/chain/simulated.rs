//! In-memory HTLC chain for exercising the watcher and coordinator

use super::{
    Chain, ChainAdapter, EscrowParams, EscrowRef, Settlement, TxRef,
};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventKind};
use crate::secret::{verify, Secret};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SimEscrow {
    pub params: EscrowParams,
    pub completed: bool,
    pub refunded: bool,
    pub secret: Option<Secret>,
}

#[derive(Debug)]
struct SimState {
    head: u64,
    next_id: u64,
    escrows: HashMap<EscrowRef, SimEscrow>,
    events: Vec<ChainEvent>,
    failures: u32,
    reject_creates: Option<String>,
    now: DateTime<Utc>,
    calls: Vec<String>,
    balance: String,
}

/// Chain whose head, clock and failures are driven by the test
#[derive(Debug)]
pub struct SimulatedChain {
    chain: Chain,
    depth: u64,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(chain: Chain, depth: u64) -> Self {
        Self {
            chain,
            depth,
            state: Mutex::new(SimState {
                head: 0,
                next_id: 1,
                escrows: HashMap::new(),
                events: Vec::new(),
                failures: 0,
                reject_creates: None,
                now: Utc::now(),
                calls: Vec::new(),
                balance: "1000000".into(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    pub fn head(&self) -> u64 {
        self.lock().head
    }

    /// Advance the head far enough for everything mined so far to be final
    pub fn finalize(&self) {
        let mut state = self.lock();
        state.head += self.depth;
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    pub fn set_balance(&self, balance: &str) {
        self.lock().balance = balance.to_string();
    }

    pub fn push_event(&self, event: ChainEvent) {
        self.lock().events.push(event);
    }

    pub fn remove_events_at(&self, height: u64) {
        self.lock().events.retain(|e| e.block_height != height);
    }

    /// Make the next `n` RPC-style calls fail transiently
    pub fn fail_next_calls(&self, n: u32) {
        self.lock().failures = n;
    }

    pub fn reject_creates(&self, reason: &str) {
        self.lock().reject_creates = Some(reason.to_string());
    }

    pub fn escrow(&self, escrow: &EscrowRef) -> Option<SimEscrow> {
        self.lock().escrows.get(escrow).cloned()
    }

    pub fn escrows(&self) -> Vec<(EscrowRef, SimEscrow)> {
        let mut all: Vec<_> = self
            .lock()
            .escrows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Every event mined so far, in height order
    pub fn events(&self) -> Vec<ChainEvent> {
        let mut events = self.lock().events.clone();
        events.sort_by_key(|e| e.block_height);
        events
    }

    /// Number of successful calls of one operation
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == op).count()
    }

    /// Withdraw as the beneficiary would, outside the coordinator
    pub fn withdraw_externally(&self, escrow: &EscrowRef, secret: &Secret) {
        let mut state = self.lock();
        if let Some(entry) = state.escrows.get_mut(escrow) {
            entry.completed = true;
            entry.secret = Some(secret.clone());
        }
        Self::mine(&mut state, self.chain, escrow, EventKind::Completed, Some(secret.clone()));
    }

    fn take_failure(&self) -> RelayerResult<()> {
        let mut state = self.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(RelayerError::TransientRpc {
                chain: self.chain,
                message: "simulated outage".into(),
            });
        }
        Ok(())
    }

    fn mine(
        state: &mut SimState,
        chain: Chain,
        escrow: &EscrowRef,
        kind: EventKind,
        secret: Option<Secret>,
    ) -> String {
        state.head += 1;
        let tx = format!("{}-tx-{}", chain, state.head);
        let entry = state.escrows.get(escrow);
        let event = ChainEvent {
            chain,
            escrow_ref: escrow.clone(),
            kind,
            block_height: state.head,
            tx_ref: tx.clone(),
            amount: entry
                .filter(|_| kind == EventKind::EscrowCreated)
                .map(|e| e.params.amount.clone()),
            hashlock: entry.map(|e| e.params.hashlock),
            secret,
        };
        state.events.push(event);
        tx
    }
}

#[async_trait]
impl ChainAdapter for SimulatedChain {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn signer_address(&self) -> String {
        format!("{}-coordinator", self.chain)
    }

    fn finality_depth(&self) -> u64 {
        self.depth
    }

    async fn create_escrow(&self, params: &EscrowParams) -> RelayerResult<EscrowRef> {
        self.take_failure()?;
        let mut state = self.lock();
        if let Some(reason) = state.reject_creates.clone() {
            return Err(RelayerError::EscrowCreationFailed {
                chain: self.chain,
                reason,
            });
        }

        let escrow = EscrowRef::new(format!("{}-escrow-{}", self.chain, state.next_id));
        state.next_id += 1;
        state.escrows.insert(
            escrow.clone(),
            SimEscrow {
                params: params.clone(),
                completed: false,
                refunded: false,
                secret: None,
            },
        );
        state.calls.push("create".into());
        Self::mine(&mut state, self.chain, &escrow, EventKind::EscrowCreated, None);
        Ok(escrow)
    }

    async fn complete_escrow(&self, escrow: &EscrowRef, secret: &Secret) -> RelayerResult<TxRef> {
        self.take_failure()?;
        let mut state = self.lock();
        let now = state.now;
        let entry = state.escrows.get_mut(escrow).ok_or_else(|| RelayerError::ChainRejection {
            chain: self.chain,
            reason: "contractId does not exist".into(),
        })?;

        if entry.completed {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if entry.refunded {
            return Err(RelayerError::ChainRejection {
                chain: self.chain,
                reason: "withdrawable: already refunded".into(),
            });
        }
        if !verify(secret, &entry.params.hashlock) {
            return Err(RelayerError::ChainRejection {
                chain: self.chain,
                reason: "hashlock hash does not match".into(),
            });
        }
        if now >= entry.params.timelock {
            return Err(RelayerError::ChainRejection {
                chain: self.chain,
                reason: "withdrawable: timelock time must be in the future".into(),
            });
        }

        entry.completed = true;
        entry.secret = Some(secret.clone());
        state.calls.push("complete".into());
        let tx = Self::mine(
            &mut state,
            self.chain,
            escrow,
            EventKind::Completed,
            Some(secret.clone()),
        );
        Ok(TxRef::Submitted(tx))
    }

    async fn revealed_secret(&self, escrow: &EscrowRef) -> RelayerResult<Option<Secret>> {
        self.take_failure()?;
        Ok(self.lock().escrows.get(escrow).and_then(|e| e.secret.clone()))
    }

    async fn refund_escrow(&self, escrow: &EscrowRef) -> RelayerResult<TxRef> {
        self.take_failure()?;
        let mut state = self.lock();
        let now = state.now;
        let entry = state.escrows.get_mut(escrow).ok_or_else(|| RelayerError::ChainRejection {
            chain: self.chain,
            reason: "contractId does not exist".into(),
        })?;

        if entry.completed {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if entry.refunded {
            return Ok(TxRef::AlreadySettled(Settlement::Refunded));
        }
        if now < entry.params.timelock {
            return Err(RelayerError::TimelockNotExpired {
                chain: self.chain,
                escrow_ref: escrow.to_string(),
            });
        }

        entry.refunded = true;
        state.calls.push("refund".into());
        let tx = Self::mine(&mut state, self.chain, escrow, EventKind::Refunded, None);
        Ok(TxRef::Submitted(tx))
    }

    async fn latest_height(&self) -> RelayerResult<u64> {
        self.take_failure()?;
        Ok(self.lock().head)
    }

    async fn fetch_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        self.take_failure()?;
        Ok(self
            .events()
            .into_iter()
            .filter(|e| e.block_height >= from && e.block_height <= to)
            .collect())
    }

    async fn get_balance(&self, _address: &str) -> RelayerResult<String> {
        self.take_failure()?;
        Ok(self.lock().balance.clone())
    }

    fn is_valid_address(&self, address: &str) -> bool {
        !address.is_empty()
            && address
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }
}
