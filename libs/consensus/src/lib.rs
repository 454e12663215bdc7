//! Consensus
//!
//! A leader-based replicated log in the Raft style. Committed entries are
//! applied, in log order on every node, to the cluster [`Registry`]
//! (the state machine); `process` proposes an entry and resolves with the
//! registry's reply once the entry is committed and applied, which makes it
//! linearizable on the leader and a read barrier everywhere.
//!
//! The engine is transport-agnostic: outbound traffic goes through the
//! [`RaftTransport`] trait and inbound traffic arrives via
//! [`ConsensusNode::step`]. Time is externalized as a tick channel
//! (~10 ms); election timeouts and heartbeats are counted in ticks.
//!
//! [`Registry`]: hivemind_registry::Registry

mod message;
mod node;
mod storage;

pub use message::{EntryPayload, LogEntry, RaftMessage};
pub use node::{ConsensusConfig, ConsensusNode, RaftTransport};
pub use storage::{HardState, RaftStorage, SnapshotMeta};
