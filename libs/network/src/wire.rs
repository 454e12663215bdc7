//! Envelopes of the v1 inter-node protocol.

use hivemind_types::{BeeId, HiveError, NodeId, NodeInfo, Tx};
use serde::{Deserialize, Serialize};

/// Control command addressed to a specific bee on the receiving node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BeeWireCmd {
    Stop,
    ListSlaves,
    AddSlave(BeeId),
    DelSlave(BeeId),
    /// Replication: append the transaction to the slave's buffer.
    BufferTx(Tx),
    /// Replication: mark the buffered transaction with this seq committed.
    CommitTx(u64),
}

/// Control command addressed to the receiving node itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HiveWireCmd {
    Ping,
    /// Asks the cluster for a fresh node id; used by joining nodes.
    NewHiveId { addr: String },
    /// Asks the receiver to add a node to the consensus membership.
    AddHive { info: NodeInfo },
    LiveHives,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteCmd {
    ToBee { bee: BeeId, cmd: BeeWireCmd },
    ToHive { cmd: HiveWireCmd },
}

/// Payload of a successful command result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmdData {
    Slaves(Vec<BeeId>),
    NodeId(NodeId),
    Nodes(Vec<NodeInfo>),
}

/// Every v1 response carries one of these: optional data plus a typed
/// error field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CmdResult {
    pub data: Option<CmdData>,
    pub err: Option<HiveError>,
}

impl CmdResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(data: CmdData) -> Self {
        Self {
            data: Some(data),
            err: None,
        }
    }

    pub fn from_err(err: HiveError) -> Self {
        Self {
            data: None,
            err: Some(err),
        }
    }

    pub fn into_result(self) -> Result<Option<CmdData>, HiveError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}
