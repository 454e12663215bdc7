//! Transaction records replicated between a master bee and its slaves.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// A single staged state operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxOp {
    Put {
        dict: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Del {
        dict: String,
        key: Vec<u8>,
    },
}

impl TxOp {
    pub fn dict(&self) -> &str {
        match self {
            TxOp::Put { dict, .. } | TxOp::Del { dict, .. } => dict,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            TxOp::Put { key, .. } | TxOp::Del { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Open,
    Committed,
    Aborted,
}

/// A transaction: the staged operations and the messages emitted while it
/// was open, grouped for atomic commit and replication.
///
/// `seq` is gap-free per bee and starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub seq: u64,
    pub ops: Vec<TxOp>,
    pub msgs: Vec<Message>,
    pub status: TxStatus,
}

impl Tx {
    pub fn new(seq: u64, ops: Vec<TxOp>, msgs: Vec<Message>) -> Self {
        Self {
            seq,
            ops,
            msgs,
            status: TxStatus::Open,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.msgs.is_empty()
    }
}
