//! Commands applied to the registry state machine.
//!
//! These are the only way the directory mutates. They travel inside
//! consensus log entries, so every variant is serializable and its apply
//! semantics are deterministic.

use hivemind_types::{AppName, BeeId, CellKey, Colony, HiveError, NodeId, NodeInfo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryCommand {
    /// Read barrier: proves the proposer has caught up with the commit
    /// index once the reply arrives.
    NoOp,
    /// Assigns a fresh node id and inserts the node into the directory.
    NewNodeId { addr: String },
    /// Idempotent node insertion; conflicts when the id is already present
    /// with a different address.
    AddNode { info: NodeInfo },
    /// Assigns a fresh app-local bee id.
    NewBeeId { app: AppName },
    /// Creates a bee and atomically binds its cells. Either everything
    /// applies or nothing does.
    CreateBee {
        id: BeeId,
        colony: Colony,
        cells: Vec<CellKey>,
    },
    /// Presence check used while rebuilding a node's bees after restart.
    ReloadBee { id: BeeId },
    /// Binds additional cells to an existing bee, atomically.
    BindCells { bee: BeeId, cells: Vec<CellKey> },
    AddSlave { bee: BeeId, slave: BeeId },
    RemoveSlave { bee: BeeId, slave: BeeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryReply {
    Unit,
    NodeId(NodeId),
    /// The app-local component of a freshly assigned bee id.
    BeeLocalId(u64),
}

/// Outcome of applying a command. Conflicts are part of the result so the
/// proposer can react; they are not consensus failures.
pub type RegistryResult = std::result::Result<RegistryReply, HiveError>;
