//! Swap coordination
//!
//! The coordinator:
//! 1. Accepts bridge requests and quotes the destination leg
//! 2. Locks the source escrow, then mirrors it on the destination chain
//! 3. Reveals the secret once the destination lock is final
//! 4. Claims the source escrow, or refunds both legs after the timelocks

pub mod engine;
pub mod lanes;
pub mod swap;

pub use engine::{CoordinatorConfig, SwapCoordinator};
pub use swap::{BridgeRequest, Swap, SwapId, SwapState, SwapStats, SwapTicket, Transition};
