//! Coordination primitives built on the store's own atomic operations.
//!
//! - [`Blackboard`]: advisory hints with swarm visibility and subscriptions
//! - [`ConsensusGate`]: quorum voting with exactly-once resolution

mod blackboard;
mod consensus;

pub use blackboard::{Blackboard, Hint, HintNotification, Subscription};
pub use consensus::{ConsensusGate, VoteReceipt};
