//! Cluster identifiers: nodes, bees, cells, and colonies.

use serde::{Deserialize, Serialize};

/// Identifier of a hive (a node process) in the cluster.
///
/// Assigned by the consensus-backed registry on first join and stable for
/// the node's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hive-{}", self.0)
    }
}

/// A node's directory entry: its identifier and listening address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: String,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Process-local namespace for bees and handlers.
pub type AppName = String;

/// Cluster-unique identifier of a bee.
///
/// The node component names the hive hosting the bee, the app component the
/// application it belongs to, and `id` the app-local counter assigned by
/// consensus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeeId {
    pub node: NodeId,
    pub app: AppName,
    pub id: u64,
    pub detached: bool,
}

impl BeeId {
    pub fn new(node: NodeId, app: impl Into<AppName>, id: u64) -> Self {
        Self {
            node,
            app: app.into(),
            id,
            detached: false,
        }
    }

    /// A zero bee id is used as the "no sender" marker on messages.
    pub fn is_nil(&self) -> bool {
        self.node.0 == 0 && self.app.is_empty() && self.id == 0
    }
}

impl std::fmt::Display for BeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.app, self.id, self.node)
    }
}

/// A (dictionary, key) pair that can be bound to exactly one bee
/// cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub dict: String,
    pub key: Vec<u8>,
}

impl CellKey {
    pub fn new(dict: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dict, String::from_utf8_lossy(&self.key))
    }
}

/// The master bee of a cell group together with its replica bees on other
/// nodes.
///
/// Invariants: the master is never listed among the slaves, and each member
/// lives on a distinct node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colony {
    pub master: BeeId,
    pub slaves: Vec<BeeId>,
}

impl Colony {
    pub fn new(master: BeeId) -> Self {
        Self {
            master,
            slaves: Vec::new(),
        }
    }

    /// Adds a slave, returning false if it is already a member or is the
    /// master itself.
    pub fn add_slave(&mut self, id: BeeId) -> bool {
        if id == self.master || self.slaves.contains(&id) {
            return false;
        }
        self.slaves.push(id);
        true
    }

    /// Removes a slave, returning false if it is not a member.
    pub fn del_slave(&mut self, id: &BeeId) -> bool {
        match self.slaves.iter().position(|s| s == id) {
            Some(i) => {
                self.slaves.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &BeeId) -> bool {
        self.master == *id || self.slaves.contains(id)
    }

    /// Set-wise equality: same master and the same slaves regardless of
    /// order.
    pub fn same_as(&self, other: &Colony) -> bool {
        if self.master != other.master || self.slaves.len() != other.slaves.len() {
            return false;
        }
        self.slaves.iter().all(|s| other.slaves.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bee(node: u64, id: u64) -> BeeId {
        BeeId::new(NodeId(node), "app", id)
    }

    #[test]
    fn colony_rejects_duplicate_slave() {
        let mut c = Colony::new(bee(1, 1));
        assert!(c.add_slave(bee(2, 2)));
        assert!(!c.add_slave(bee(2, 2)));
        assert!(!c.add_slave(bee(1, 1)), "master cannot be its own slave");
        assert_eq!(c.slaves.len(), 1);
    }

    #[test]
    fn colony_del_slave_unknown() {
        let mut c = Colony::new(bee(1, 1));
        c.add_slave(bee(2, 2));
        assert!(!c.del_slave(&bee(3, 3)));
        assert!(c.del_slave(&bee(2, 2)));
        assert!(c.slaves.is_empty());
    }

    #[test]
    fn colony_same_as_ignores_order() {
        let mut a = Colony::new(bee(1, 1));
        a.add_slave(bee(2, 2));
        a.add_slave(bee(3, 3));
        let mut b = Colony::new(bee(1, 1));
        b.add_slave(bee(3, 3));
        b.add_slave(bee(2, 2));
        assert!(a.same_as(&b));
        b.del_slave(&bee(2, 2));
        assert!(!a.same_as(&b));
    }
}
