//! Cluster Registry
//!
//! The replicated directory of the cluster: node membership, bee colonies,
//! and cell-to-bee bindings. The snapshot is a pure state machine — the only
//! mutation path is [`Registry::apply`], invoked by the consensus apply task
//! for each committed log entry, in log order, on every node. Reads are
//! served locally from the last applied snapshot.

mod command;
mod state;

pub use command::{RegistryCommand, RegistryReply, RegistryResult};
pub use state::RegistryState;

use hivemind_types::{BeeId, CellKey, Colony, NodeId, NodeInfo, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-concurrent wrapper around the registry snapshot.
///
/// Readers see a monotonically advancing applied index; the writer is the
/// single consensus apply task.
#[derive(Default)]
pub struct Registry {
    snapshot: RwLock<RegistryState>,
    applied_index: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed entry. `index` is the entry's log index and
    /// becomes the new applied index.
    pub fn apply(&self, index: u64, cmd: &RegistryCommand) -> RegistryResult {
        let mut snap = self.snapshot.write();
        let result = snap.apply(cmd);
        self.applied_index.store(index, Ordering::Release);
        result
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.snapshot.read().nodes().cloned().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.snapshot.read().node(id).cloned()
    }

    pub fn bee(&self, id: &BeeId) -> Option<Colony> {
        self.snapshot.read().colony(id).cloned()
    }

    /// Master bees hosted on the given node.
    pub fn bees_of_node(&self, id: NodeId) -> Vec<BeeId> {
        self.snapshot.read().bees_of_node(id)
    }

    pub fn binding_of(&self, app: &str, cell: &CellKey) -> Option<BeeId> {
        self.snapshot.read().binding_of(app, cell).cloned()
    }

    /// Cells bound to the given bee.
    pub fn cells_of(&self, bee: &BeeId) -> Vec<CellKey> {
        self.snapshot.read().cells_of(bee)
    }

    /// Serializes the snapshot for log compaction.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>> {
        hivemind_codec::encode_frame(&*self.snapshot.read())
    }

    /// Replaces the snapshot from a compaction image taken at `index`.
    pub fn restore_snapshot(&self, index: u64, bytes: &[u8]) -> Result<()> {
        let state: RegistryState = hivemind_codec::decode_frame(bytes)?;
        *self.snapshot.write() = state;
        self.applied_index.store(index, Ordering::Release);
        Ok(())
    }
}
