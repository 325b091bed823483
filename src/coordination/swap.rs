//! Swap records and their state machine

use crate::chain::{Chain, EscrowRef};
use crate::error::{RelayerError, RelayerResult};
use crate::secret::{Hashlock, Secret};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Coordinator-assigned swap identifier (UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(String);

impl SwapId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SwapId {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(|id| Self(id.to_string()))
            .map_err(|_| RelayerError::SwapNotFound(s.to_string()))
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Swap lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    SourceLocked,
    DestLocked,
    SecretRevealed,
    Completed,
    Refunded,
    Failed,
}

impl SwapState {
    pub const ALL: [SwapState; 7] = [
        SwapState::Created,
        SwapState::SourceLocked,
        SwapState::DestLocked,
        SwapState::SecretRevealed,
        SwapState::Completed,
        SwapState::Refunded,
        SwapState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Created => "created",
            SwapState::SourceLocked => "source_locked",
            SwapState::DestLocked => "dest_locked",
            SwapState::SecretRevealed => "secret_revealed",
            SwapState::Completed => "completed",
            SwapState::Refunded => "refunded",
            SwapState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Completed | SwapState::Refunded | SwapState::Failed
        )
    }

    /// Allowed forward moves. `Created -> Refunded` covers a source escrow
    /// whose creation was never observed final but whose reference is known.
    pub fn can_transition_to(&self, next: SwapState) -> bool {
        use SwapState::*;
        matches!(
            (self, next),
            (Created, SourceLocked)
                | (Created, Refunded)
                | (Created, Failed)
                | (SourceLocked, DestLocked)
                | (SourceLocked, Completed)
                | (SourceLocked, Refunded)
                | (SourceLocked, Failed)
                | (DestLocked, SecretRevealed)
                | (DestLocked, Completed)
                | (DestLocked, Refunded)
                | (SecretRevealed, Completed)
                | (SecretRevealed, Refunded)
        )
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("unknown swap state {}", s)))
    }
}

/// One cross-chain swap
#[derive(Debug, Clone, Serialize)]
pub struct Swap {
    pub id: SwapId,
    pub source_chain: Chain,
    pub dest_chain: Chain,
    pub initiator: String,
    pub beneficiary: String,
    /// Whole source-native units
    pub amount: String,
    /// Whole destination-native units, quoted at creation
    pub dest_amount: String,
    #[serde(skip_serializing)]
    pub secret: Option<Secret>,
    pub hashlock: Hashlock,
    pub timelock_source: DateTime<Utc>,
    pub timelock_dest: DateTime<Utc>,
    pub state: SwapState,
    pub source_escrow_ref: Option<EscrowRef>,
    pub dest_escrow_ref: Option<EscrowRef>,
    pub dest_confirmed: bool,
    pub dest_completed: bool,
    pub refund_requested: bool,
    pub source_refund_tx: Option<String>,
    pub dest_refund_tx: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub swap_id: SwapId,
    pub from_state: Option<SwapState>,
    pub to_state: SwapState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Which side of a swap an escrow belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Source,
    Dest,
}

impl Swap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_chain: Chain,
        dest_chain: Chain,
        initiator: String,
        beneficiary: String,
        amount: String,
        dest_amount: String,
        secret: Secret,
        timelock_source: DateTime<Utc>,
        timelock_dest: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SwapId::generate(),
            source_chain,
            dest_chain,
            initiator,
            beneficiary,
            amount,
            dest_amount,
            hashlock: secret.hashlock(),
            secret: Some(secret),
            timelock_source,
            timelock_dest,
            state: SwapState::Created,
            source_escrow_ref: None,
            dest_escrow_ref: None,
            dest_confirmed: false,
            dest_completed: false,
            refund_requested: false,
            source_refund_tx: None,
            dest_refund_tx: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Audit row for the creation itself
    pub fn created_transition(&self) -> Transition {
        Transition {
            swap_id: self.id.clone(),
            from_state: None,
            to_state: SwapState::Created,
            reason: "bridge request".into(),
            at: self.created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Secret as it may be written to storage: nothing once it is public
    pub fn storable_secret(&self) -> Option<&Secret> {
        match self.state {
            SwapState::Created | SwapState::SourceLocked | SwapState::DestLocked
                if !self.dest_completed =>
            {
                self.secret.as_ref()
            }
            _ => None,
        }
    }

    pub fn leg_for(&self, chain: Chain) -> Option<Leg> {
        if chain == self.source_chain {
            Some(Leg::Source)
        } else if chain == self.dest_chain {
            Some(Leg::Dest)
        } else {
            None
        }
    }

    pub fn escrow_ref(&self, leg: Leg) -> Option<&EscrowRef> {
        match leg {
            Leg::Source => self.source_escrow_ref.as_ref(),
            Leg::Dest => self.dest_escrow_ref.as_ref(),
        }
    }

    /// Move to `next`, wiping the secret once the swap is terminal
    pub fn transition(
        &mut self,
        next: SwapState,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> RelayerResult<Transition> {
        if !self.state.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        let transition = Transition {
            swap_id: self.id.clone(),
            from_state: Some(self.state),
            to_state: next,
            reason: reason.into(),
            at: now,
        };
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.secret = None;
        }
        Ok(transition)
    }
}

/// Inbound bridge request
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeRequest {
    pub source_chain: Chain,
    pub dest_chain: Chain,
    pub amount: String,
    pub initiator_address: String,
    pub beneficiary_address: String,
}

/// Reply to an accepted bridge request
#[derive(Debug, Clone, Serialize)]
pub struct SwapTicket {
    pub swap_id: SwapId,
    pub hashlock: Hashlock,
    pub timelock_source: DateTime<Utc>,
    pub timelock_dest: DateTime<Utc>,
    pub dest_amount: String,
}

impl From<&Swap> for SwapTicket {
    fn from(swap: &Swap) -> Self {
        Self {
            swap_id: swap.id.clone(),
            hashlock: swap.hashlock,
            timelock_source: swap.timelock_source,
            timelock_dest: swap.timelock_dest,
            dest_amount: swap.dest_amount.clone(),
        }
    }
}

/// Swap counts per state
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapStats {
    pub total: u64,
    pub by_state: BTreeMap<SwapState, u64>,
}

impl SwapStats {
    pub fn from_states(states: impl IntoIterator<Item = SwapState>) -> Self {
        let mut stats = SwapStats::default();
        for state in states {
            stats.total += 1;
            *stats.by_state.entry(state).or_default() += 1;
        }
        stats
    }

    pub fn active(&self) -> u64 {
        self.by_state
            .iter()
            .filter(|(state, _)| !state.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}
