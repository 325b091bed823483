//! Normalized chain events and HTLC log decoding
//!
//! Every adapter reduces its native notifications to [`ChainEvent`]. The EVM
//! and TRON adapters share the Solidity HTLC ABI, so their logs are decoded by
//! the same [`HtlcLogParser`].

use crate::chain::{units, Chain, EscrowRef};
use crate::error::{RelayerError, RelayerResult};
use crate::secret::{Hashlock, Secret};

use ethers::abi::{self, ParamType, Token};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EscrowCreated,
    Completed,
    Refunded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EscrowCreated => "escrow_created",
            EventKind::Completed => "completed",
            EventKind::Refunded => "refunded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain-agnostic escrow signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: Chain,
    pub escrow_ref: EscrowRef,
    pub kind: EventKind,
    pub block_height: u64,
    /// Transaction that emitted the event
    pub tx_ref: String,
    /// Locked amount in whole native units, for `EscrowCreated`
    pub amount: Option<String>,
    pub hashlock: Option<Hashlock>,
    /// Revealed preimage, for `Completed`
    pub secret: Option<Secret>,
}

/// Key used to discard redelivered events
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub chain: Chain,
    pub escrow_ref: EscrowRef,
    pub kind: EventKind,
}

impl ChainEvent {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            chain: self.chain,
            escrow_ref: self.escrow_ref.clone(),
            kind: self.kind,
        }
    }

    /// Identity within a rescan window; distinguishes re-emitted events on a
    /// different block after a reorg.
    pub fn scan_key(&self) -> (EventKind, EscrowRef, String) {
        (self.kind, self.escrow_ref.clone(), self.tx_ref.clone())
    }

    /// Name for metrics and logs
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;
    use sha3::{Digest, Keccak256};

    pub const HTLC_NEW_SIGNATURE: &str =
        "LogHTLCNew(bytes32,address,address,uint256,bytes32,uint256)";
    pub const HTLC_WITHDRAW_SIGNATURE: &str = "LogHTLCWithdraw(bytes32,bytes32)";
    pub const HTLC_REFUND_SIGNATURE: &str = "LogHTLCRefund(bytes32)";

    pub fn topic(signature: &str) -> H256 {
        H256::from_slice(&Keccak256::digest(signature.as_bytes()))
    }

    lazy_static! {
        pub static ref HTLC_NEW: H256 = topic(HTLC_NEW_SIGNATURE);
        pub static ref HTLC_WITHDRAW: H256 = topic(HTLC_WITHDRAW_SIGNATURE);
        pub static ref HTLC_REFUND: H256 = topic(HTLC_REFUND_SIGNATURE);
    }
}

/// Decoder for HTLC contract logs on EVM-style chains
#[derive(Debug, Clone)]
pub struct HtlcLogParser {
    chain: Chain,
    decimals: u32,
}

impl HtlcLogParser {
    pub fn new(chain: Chain, decimals: u32) -> Self {
        Self { chain, decimals }
    }

    /// Decode one log. Unrelated topics yield `None`.
    pub fn parse(
        &self,
        log_topics: &[H256],
        data: &[u8],
        block_height: u64,
        tx_ref: String,
    ) -> RelayerResult<Option<ChainEvent>> {
        let Some(topic) = log_topics.first() else {
            return Ok(None);
        };
        let contract_id = log_topics
            .get(1)
            .map(|t| EscrowRef::new(format!("{:?}", t)))
            .ok_or_else(|| RelayerError::EventParsing("missing contractId topic".into()))?;

        let mut event = ChainEvent {
            chain: self.chain,
            escrow_ref: contract_id,
            kind: EventKind::EscrowCreated,
            block_height,
            tx_ref,
            amount: None,
            hashlock: None,
            secret: None,
        };

        if *topic == *topics::HTLC_NEW {
            // amount, hashlock, timelock are non-indexed
            let tokens = abi::decode(
                &[
                    ParamType::Uint(256),
                    ParamType::FixedBytes(32),
                    ParamType::Uint(256),
                ],
                data,
            )
            .map_err(|e| RelayerError::EventParsing(format!("LogHTLCNew data: {}", e)))?;

            let amount = match &tokens[0] {
                Token::Uint(v) => units::from_base_units(*v, self.decimals)?,
                other => {
                    return Err(RelayerError::EventParsing(format!(
                        "unexpected amount token {:?}",
                        other
                    )))
                }
            };
            let hashlock = fixed_bytes(&tokens[1]).and_then(|b| Hashlock::from_slice(&b))?;

            event.amount = Some(amount);
            event.hashlock = Some(hashlock);
        } else if *topic == *topics::HTLC_WITHDRAW {
            let tokens = abi::decode(&[ParamType::FixedBytes(32)], data)
                .map_err(|e| RelayerError::EventParsing(format!("LogHTLCWithdraw data: {}", e)))?;
            let secret = fixed_bytes(&tokens[0]).and_then(|b| Secret::from_slice(&b))?;
            event.kind = EventKind::Completed;
            event.hashlock = Some(secret.hashlock());
            event.secret = Some(secret);
        } else if *topic == *topics::HTLC_REFUND {
            event.kind = EventKind::Refunded;
        } else {
            return Ok(None);
        }

        Ok(Some(event))
    }
}

fn fixed_bytes(token: &Token) -> RelayerResult<Vec<u8>> {
    match token {
        Token::FixedBytes(b) => Ok(b.clone()),
        other => Err(RelayerError::EventParsing(format!(
            "expected bytes32, got {:?}",
            other
        ))),
    }
}
