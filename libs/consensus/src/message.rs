//! Log entries and the inter-node consensus protocol.

use hivemind_registry::{RegistryCommand, RegistryResult};
use hivemind_types::{NodeId, NodeInfo};
use serde::{Deserialize, Serialize};

use crate::storage::SnapshotMeta;

/// What a log entry carries: a registry command or a membership change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    Registry(RegistryCommand),
    AddPeer { info: NodeInfo },
    RemovePeer { id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// The consensus wire protocol.
///
/// `ForwardPropose`/`ForwardReply` carry proposals submitted on a follower
/// to the leader and the applied result back, so `process` works on every
/// node. The reply is resolved only once the follower itself has applied the
/// entry's index, preserving the read-barrier property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        from: NodeId,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesReply {
        term: u64,
        from: NodeId,
        success: bool,
        match_index: u64,
    },
    InstallSnapshot {
        term: u64,
        leader: NodeId,
        meta: SnapshotMeta,
        data: Vec<u8>,
    },
    ForwardPropose {
        from: NodeId,
        seq: u64,
        payload: EntryPayload,
    },
    ForwardReply {
        seq: u64,
        index: u64,
        result: RegistryResult,
    },
}

impl RaftMessage {
    /// The term the message was produced in; used for stale-message checks.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteReply { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesReply { term, .. }
            | RaftMessage::InstallSnapshot { term, .. } => Some(*term),
            RaftMessage::ForwardPropose { .. } | RaftMessage::ForwardReply { .. } => None,
        }
    }
}
