//! The registry snapshot and its apply function.

use crate::command::{RegistryCommand, RegistryReply, RegistryResult};
use hivemind_types::{AppName, BeeId, CellKey, Colony, HiveError, NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// The directory state. Mutated only through [`RegistryState::apply`].
///
/// Cell bindings are namespaced per app: two apps may map the same
/// (dict, key) pair without conflicting.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RegistryState {
    nodes: BTreeMap<NodeId, NodeInfo>,
    bees: BTreeMap<BeeId, Colony>,
    bindings: BTreeMap<(AppName, CellKey), BeeId>,
    next_node_id: u64,
    next_bee_ids: BTreeMap<AppName, u64>,
}

impl RegistryState {
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn colony(&self, id: &BeeId) -> Option<&Colony> {
        self.bees.get(id)
    }

    pub fn bees_of_node(&self, id: NodeId) -> Vec<BeeId> {
        self.bees
            .keys()
            .filter(|b| b.node == id)
            .cloned()
            .collect()
    }

    pub fn binding_of(&self, app: &str, cell: &CellKey) -> Option<&BeeId> {
        self.bindings.get(&(app.to_string(), cell.clone()))
    }

    pub fn cells_of(&self, bee: &BeeId) -> Vec<CellKey> {
        self.bindings
            .iter()
            .filter(|(_, b)| *b == bee)
            .map(|((_, c), _)| c.clone())
            .collect()
    }

    /// One deterministic step of the state machine.
    pub fn apply(&mut self, cmd: &RegistryCommand) -> RegistryResult {
        match cmd {
            RegistryCommand::NoOp => Ok(RegistryReply::Unit),

            RegistryCommand::NewNodeId { addr } => {
                let id = self.fresh_node_id();
                self.nodes.insert(id, NodeInfo::new(id, addr.clone()));
                debug!(node = %id, addr = %addr, "assigned node id");
                Ok(RegistryReply::NodeId(id))
            }

            RegistryCommand::AddNode { info } => match self.nodes.get(&info.id) {
                Some(existing) if existing.addr == info.addr => Ok(RegistryReply::Unit),
                Some(existing) => Err(HiveError::conflict(format!(
                    "node {} already registered at {}",
                    info.id, existing.addr
                ))),
                None => {
                    self.nodes.insert(info.id, info.clone());
                    if info.id.0 >= self.next_node_id {
                        self.next_node_id = info.id.0 + 1;
                    }
                    Ok(RegistryReply::Unit)
                }
            },

            RegistryCommand::NewBeeId { app } => {
                let next = self.next_bee_ids.entry(app.clone()).or_insert(1);
                let id = *next;
                *next += 1;
                Ok(RegistryReply::BeeLocalId(id))
            }

            RegistryCommand::CreateBee { id, colony, cells } => {
                if colony.master != *id {
                    return Err(HiveError::conflict(format!(
                        "colony master {} does not match bee {}",
                        colony.master, id
                    )));
                }
                if let Some(existing) = self.bees.get(id) {
                    // Replayed proposal: accept if it changes nothing.
                    if existing.same_as(colony) && self.all_bound_to(cells, id) {
                        return Ok(RegistryReply::Unit);
                    }
                    return Err(HiveError::conflict(format!("bee {id} already exists")));
                }
                self.check_unbound(cells, id)?;
                self.bees.insert(id.clone(), colony.clone());
                for cell in cells {
                    self.bindings
                        .insert((id.app.clone(), cell.clone()), id.clone());
                }
                debug!(bee = %id, cells = cells.len(), "created bee");
                Ok(RegistryReply::Unit)
            }

            RegistryCommand::ReloadBee { id } => {
                if self.bees.contains_key(id) {
                    Ok(RegistryReply::Unit)
                } else {
                    Err(HiveError::UnknownBee(id.clone()))
                }
            }

            RegistryCommand::BindCells { bee, cells } => {
                if !self.bees.contains_key(bee) {
                    return Err(HiveError::UnknownBee(bee.clone()));
                }
                self.check_unbound(cells, bee)?;
                for cell in cells {
                    self.bindings
                        .insert((bee.app.clone(), cell.clone()), bee.clone());
                }
                Ok(RegistryReply::Unit)
            }

            RegistryCommand::AddSlave { bee, slave } => {
                let colony = self
                    .bees
                    .get_mut(bee)
                    .ok_or_else(|| HiveError::UnknownBee(bee.clone()))?;
                if colony.master.node == slave.node
                    || colony.slaves.iter().any(|s| s.node == slave.node)
                {
                    return Err(HiveError::conflict(format!(
                        "colony of {bee} already has a member on {}",
                        slave.node
                    )));
                }
                if !colony.add_slave(slave.clone()) {
                    return Err(HiveError::conflict(format!(
                        "{slave} is already a slave of {bee}"
                    )));
                }
                Ok(RegistryReply::Unit)
            }

            RegistryCommand::RemoveSlave { bee, slave } => {
                let colony = self
                    .bees
                    .get_mut(bee)
                    .ok_or_else(|| HiveError::UnknownBee(bee.clone()))?;
                if !colony.del_slave(slave) {
                    return Err(HiveError::conflict(format!(
                        "{slave} is not a slave of {bee}"
                    )));
                }
                Ok(RegistryReply::Unit)
            }
        }
    }

    fn fresh_node_id(&mut self) -> NodeId {
        if self.next_node_id == 0 {
            self.next_node_id = 1;
        }
        while self.nodes.contains_key(&NodeId(self.next_node_id)) {
            self.next_node_id += 1;
        }
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Atomicity check: every cell must be unbound in the bee's app or
    /// already bound to `bee`; otherwise nothing is mutated.
    fn check_unbound(&self, cells: &[CellKey], bee: &BeeId) -> Result<(), HiveError> {
        for cell in cells {
            if let Some(owner) = self.binding_of(&bee.app, cell) {
                if owner != bee {
                    return Err(HiveError::conflict(format!(
                        "cell {cell} already bound to {owner}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn all_bound_to(&self, cells: &[CellKey], bee: &BeeId) -> bool {
        cells
            .iter()
            .all(|c| self.binding_of(&bee.app, c).is_some_and(|owner| owner == bee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bee(node: u64, id: u64) -> BeeId {
        BeeId::new(NodeId(node), "counter", id)
    }

    fn cell(key: &str) -> CellKey {
        CellKey::new("c", key.as_bytes().to_vec())
    }

    fn create(state: &mut RegistryState, b: &BeeId, cells: &[CellKey]) -> RegistryResult {
        state.apply(&RegistryCommand::CreateBee {
            id: b.clone(),
            colony: Colony::new(b.clone()),
            cells: cells.to_vec(),
        })
    }

    #[test]
    fn node_ids_are_fresh_and_directory_grows() {
        let mut state = RegistryState::default();
        let r1 = state
            .apply(&RegistryCommand::NewNodeId {
                addr: "localhost:7767".into(),
            })
            .unwrap();
        let r2 = state
            .apply(&RegistryCommand::NewNodeId {
                addr: "localhost:7768".into(),
            })
            .unwrap();
        assert_eq!(r1, RegistryReply::NodeId(NodeId(1)));
        assert_eq!(r2, RegistryReply::NodeId(NodeId(2)));
        assert_eq!(state.nodes().count(), 2);
    }

    #[test]
    fn add_node_is_idempotent_but_conflicts_on_new_addr() {
        let mut state = RegistryState::default();
        let info = NodeInfo::new(NodeId(1), "localhost:7767");
        state
            .apply(&RegistryCommand::AddNode { info: info.clone() })
            .unwrap();
        state
            .apply(&RegistryCommand::AddNode { info: info.clone() })
            .unwrap();
        let err = state
            .apply(&RegistryCommand::AddNode {
                info: NodeInfo::new(NodeId(1), "localhost:9999"),
            })
            .unwrap_err();
        assert_eq!(err.category(), "conflict");
        // A later fresh assignment must not reuse id 1.
        let r = state
            .apply(&RegistryCommand::NewNodeId {
                addr: "localhost:7768".into(),
            })
            .unwrap();
        assert_eq!(r, RegistryReply::NodeId(NodeId(2)));
    }

    #[test]
    fn bee_ids_count_per_app_from_one() {
        let mut state = RegistryState::default();
        let a = state
            .apply(&RegistryCommand::NewBeeId {
                app: "counter".into(),
            })
            .unwrap();
        let b = state
            .apply(&RegistryCommand::NewBeeId {
                app: "counter".into(),
            })
            .unwrap();
        let other = state
            .apply(&RegistryCommand::NewBeeId {
                app: "router".into(),
            })
            .unwrap();
        assert_eq!(a, RegistryReply::BeeLocalId(1));
        assert_eq!(b, RegistryReply::BeeLocalId(2));
        assert_eq!(other, RegistryReply::BeeLocalId(1));
    }

    #[test]
    fn second_binding_of_a_cell_conflicts() {
        let mut state = RegistryState::default();
        let winner = bee(1, 1);
        let loser = bee(2, 1);
        create(&mut state, &winner, &[cell("z")]).unwrap();
        let err = create(&mut state, &loser, &[cell("z")]).unwrap_err();
        assert_eq!(err.category(), "conflict");
        assert_eq!(state.binding_of("counter", &cell("z")), Some(&winner));
        assert!(state.colony(&loser).is_none(), "losing create left no trace");
    }

    #[test]
    fn create_bee_is_atomic_across_cells() {
        let mut state = RegistryState::default();
        create(&mut state, &bee(1, 1), &[cell("a")]).unwrap();
        let err = create(&mut state, &bee(2, 2), &[cell("b"), cell("a")]).unwrap_err();
        assert_eq!(err.category(), "conflict");
        assert_eq!(
            state.binding_of("counter", &cell("b")),
            None,
            "no partial binding"
        );
    }

    #[test]
    fn replayed_create_is_accepted() {
        let mut state = RegistryState::default();
        let b = bee(1, 1);
        create(&mut state, &b, &[cell("x")]).unwrap();
        create(&mut state, &b, &[cell("x")]).unwrap();
    }

    #[test]
    fn slave_management() {
        let mut state = RegistryState::default();
        let master = bee(1, 1);
        create(&mut state, &master, &[]).unwrap();

        let slave = bee(2, 2);
        state
            .apply(&RegistryCommand::AddSlave {
                bee: master.clone(),
                slave: slave.clone(),
            })
            .unwrap();
        // Duplicate slave and same-node member both conflict.
        assert!(state
            .apply(&RegistryCommand::AddSlave {
                bee: master.clone(),
                slave: slave.clone(),
            })
            .is_err());
        assert!(state
            .apply(&RegistryCommand::AddSlave {
                bee: master.clone(),
                slave: bee(2, 9),
            })
            .is_err());

        state
            .apply(&RegistryCommand::RemoveSlave {
                bee: master.clone(),
                slave: slave.clone(),
            })
            .unwrap();
        assert!(state
            .apply(&RegistryCommand::RemoveSlave {
                bee: master,
                slave,
            })
            .is_err());
    }

    #[test]
    fn cells_of_lists_bindings() {
        let mut state = RegistryState::default();
        let b = bee(1, 1);
        create(&mut state, &b, &[cell("x"), cell("y")]).unwrap();
        let mut cells = state.cells_of(&b);
        cells.sort();
        assert_eq!(cells, vec![cell("x"), cell("y")]);
    }
}
