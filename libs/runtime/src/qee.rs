//! The qee: per-app dispatcher owning the app's bees on this node.
//!
//! The qee is itself a single-threaded loop, so two messages racing to
//! create a bee for overlapping cells serialize naturally: lookups, the
//! consensus round trip, and bee creation happen one dispatch at a time.

use crate::app::{AppSpec, MsgAndHandler};
use crate::bee::{Bee, BeeCmdReplySender, BeeDeps, BeeHandle};
use crate::config::HiveConfig;
use hivemind_consensus::ConsensusNode;
use hivemind_network::{BeeWireCmd, ProxyPool};
use hivemind_registry::{Registry, RegistryCommand, RegistryReply};
use hivemind_types::{BeeId, CellKey, Colony, HiveError, NodeId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Attempts at winning or observing a cell binding before a message is
/// dropped.
const MAX_BIND_ATTEMPTS: u32 = 5;

pub(crate) enum QeeCtrl {
    /// Forward a control command to one of this app's bees.
    BeeCmd {
        bee: BeeId,
        cmd: BeeWireCmd,
        reply: BeeCmdReplySender,
    },
    /// Rebuild a bee owned by this node after restart.
    ReloadBee {
        id: BeeId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop every bee (with the per-bee deadline), then exit.
    Stop { reply: oneshot::Sender<()> },
}

pub(crate) struct QeeHandle {
    pub data_tx: mpsc::Sender<MsgAndHandler>,
    pub ctrl_tx: mpsc::Sender<QeeCtrl>,
    pub task: JoinHandle<()>,
}

pub(crate) struct Qee {
    node: NodeId,
    app: Arc<AppSpec>,
    bees: HashMap<BeeId, BeeHandle>,
    /// Local dispatch table; the registry holds the cluster-wide truth.
    cells: HashMap<CellKey, BeeId>,
    consensus: ConsensusNode,
    registry: Arc<Registry>,
    proxies: Arc<ProxyPool>,
    deps: BeeDeps,
    reg_lock_timeout: Duration,
    data_rx: mpsc::Receiver<MsgAndHandler>,
    ctrl_rx: mpsc::Receiver<QeeCtrl>,
}

impl Qee {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        node: NodeId,
        app: Arc<AppSpec>,
        cfg: &HiveConfig,
        consensus: ConsensusNode,
        registry: Arc<Registry>,
        proxies: Arc<ProxyPool>,
        deps: BeeDeps,
    ) -> QeeHandle {
        let (data_tx, data_rx) = mpsc::channel(cfg.data_ch_buf_size);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(cfg.cmd_ch_buf_size);
        let qee = Qee {
            node,
            app,
            bees: HashMap::new(),
            cells: HashMap::new(),
            consensus,
            registry,
            proxies,
            deps,
            reg_lock_timeout: cfg.reg_lock_timeout,
            data_rx,
            ctrl_rx,
        };
        let task = tokio::spawn(qee.run());
        QeeHandle {
            data_tx,
            ctrl_tx,
            task,
        }
    }

    async fn run(mut self) {
        info!(app = %self.app.name, node = %self.node, "qee running");
        loop {
            tokio::select! {
                mh = self.data_rx.recv() => match mh {
                    Some(mh) => self.dispatch(mh).await,
                    None => break,
                },
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(QeeCtrl::BeeCmd { bee, cmd, reply }) => {
                        self.forward_bee_cmd(bee, cmd, reply).await
                    }
                    Some(QeeCtrl::ReloadBee { id, reply }) => {
                        let _ = reply.send(self.reload_bee(id).await);
                    }
                    Some(QeeCtrl::Stop { reply }) => {
                        self.stop_bees().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        info!(app = %self.app.name, "qee stopped");
    }

    async fn dispatch(&mut self, mh: MsgAndHandler) {
        // Unicast skips the cell map: the destination bee is named.
        if let Some(to) = mh.msg.to.clone() {
            if let Err(e) = self.deliver_unicast(to, mh).await {
                error!(app = %self.app.name, error = %e, "unicast delivery failed");
            }
            return;
        }

        let cells = mh.handler.map(&mh.msg);
        if cells.is_empty() {
            warn!(app = %self.app.name, kind = %mh.msg.kind, "message maps to no cells; dropping");
            return;
        }

        match self.local_owner(&cells) {
            Err(e) => {
                error!(app = %self.app.name, kind = %mh.msg.kind, error = %e, "dropping message");
            }
            Ok(Some(owner)) => {
                if let Err(e) = self.bind_missing(&owner, &cells).await {
                    error!(app = %self.app.name, bee = %owner, error = %e, "cannot extend cell group");
                    return;
                }
                self.enqueue(&owner, mh).await;
            }
            Ok(None) => self.dispatch_unbound(cells, mh).await,
        }
    }

    /// The single local bee owning cells of the set, if any. A set spanning
    /// two local bees is an ambiguous binding.
    fn local_owner(&self, cells: &[CellKey]) -> Result<Option<BeeId>> {
        let mut owner: Option<&BeeId> = None;
        for cell in cells {
            if let Some(bee) = self.cells.get(cell) {
                match owner {
                    None => owner = Some(bee),
                    Some(o) if o == bee => {}
                    Some(o) => {
                        return Err(HiveError::conflict(format!(
                            "cells span bees {o} and {bee}"
                        )))
                    }
                }
            }
        }
        Ok(owner.cloned())
    }

    /// Binds cells the owner does not hold yet, through consensus.
    async fn bind_missing(&mut self, owner: &BeeId, cells: &[CellKey]) -> Result<()> {
        let missing: Vec<CellKey> = cells
            .iter()
            .filter(|c| !self.cells.contains_key(*c))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.consensus
            .process(RegistryCommand::BindCells {
                bee: owner.clone(),
                cells: missing.clone(),
            })
            .await?;
        for cell in missing {
            self.cells.insert(cell, owner.clone());
        }
        Ok(())
    }

    /// No local owner: look for a remote binding, otherwise race to create
    /// the bee. A lost race retries the lookup after a backoff and routes
    /// to the winner.
    async fn dispatch_unbound(&mut self, cells: Vec<CellKey>, mh: MsgAndHandler) {
        for attempt in 0..MAX_BIND_ATTEMPTS {
            if let Some(bound) = cells
                .iter()
                .find_map(|c| self.registry.binding_of(&self.app.name, c))
            {
                if bound.node == self.node && bound.app == self.app.name {
                    // Bound to this node but not instantiated yet (for
                    // example between restart and reload).
                    match self.materialize(bound.clone()) {
                        Ok(()) => self.enqueue(&bound, mh).await,
                        Err(e) => error!(bee = %bound, error = %e, "cannot materialize bee"),
                    }
                } else {
                    self.forward(bound, mh);
                }
                return;
            }

            match self.create_bee(&cells).await {
                Ok(bee) => {
                    self.enqueue(&bee, mh).await;
                    return;
                }
                Err(e) if e.is_retryable() => {
                    debug!(
                        app = %self.app.name,
                        attempt,
                        error = %e,
                        "cell binding contended; retrying lookup"
                    );
                    tokio::time::sleep(self.reg_lock_timeout).await;
                }
                Err(e) => {
                    error!(app = %self.app.name, error = %e, "cannot create bee; dropping message");
                    return;
                }
            }
        }
        error!(
            app = %self.app.name,
            kind = %mh.msg.kind,
            "giving up on cell binding after {MAX_BIND_ATTEMPTS} attempts"
        );
    }

    /// Allocates an id and proposes the compound create-and-bind.
    async fn create_bee(&mut self, cells: &[CellKey]) -> Result<BeeId> {
        let local_id = match self
            .consensus
            .process(RegistryCommand::NewBeeId {
                app: self.app.name.clone(),
            })
            .await?
        {
            RegistryReply::BeeLocalId(id) => id,
            other => {
                return Err(HiveError::fatal(format!(
                    "unexpected reply to bee id allocation: {other:?}"
                )))
            }
        };
        let id = BeeId::new(self.node, self.app.name.clone(), local_id);
        let colony = Colony::new(id.clone());
        self.consensus
            .process(RegistryCommand::CreateBee {
                id: id.clone(),
                colony: colony.clone(),
                cells: cells.to_vec(),
            })
            .await?;

        info!(bee = %id, cells = cells.len(), "created bee");
        let handle = Bee::spawn(id.clone(), colony, self.app.transactional, &self.deps);
        self.bees.insert(id.clone(), handle);
        for cell in cells {
            self.cells.insert(cell.clone(), id.clone());
        }
        Ok(id)
    }

    /// Instantiates a bee this node already owns according to the registry.
    fn materialize(&mut self, id: BeeId) -> Result<()> {
        if self.bees.contains_key(&id) {
            return Ok(());
        }
        let colony = self
            .registry
            .bee(&id)
            .ok_or_else(|| HiveError::UnknownBee(id.clone()))?;
        let handle = Bee::spawn(id.clone(), colony, self.app.transactional, &self.deps);
        self.bees.insert(id.clone(), handle);
        for cell in self.registry.cells_of(&id) {
            self.cells.insert(cell, id.clone());
        }
        Ok(())
    }

    /// Restart path: confirm the bee cluster-wide, then rebuild it locally
    /// before the node accepts traffic.
    async fn reload_bee(&mut self, id: BeeId) -> Result<()> {
        self.consensus
            .process(RegistryCommand::ReloadBee { id: id.clone() })
            .await?;
        self.materialize(id.clone())?;
        info!(bee = %id, "reloaded bee");
        Ok(())
    }

    async fn deliver_unicast(&mut self, to: BeeId, mh: MsgAndHandler) -> Result<()> {
        if to.node != self.node || to.app != self.app.name {
            self.forward(to, mh);
            return Ok(());
        }
        self.materialize(to.clone())?;
        self.enqueue(&to, mh).await;
        Ok(())
    }

    async fn enqueue(&self, bee: &BeeId, mh: MsgAndHandler) {
        let Some(handle) = self.bees.get(bee) else {
            error!(bee = %bee, "bee vanished from the dispatch table");
            return;
        };
        if handle.data_tx.send(mh).await.is_err() {
            warn!(bee = %bee, "bee data channel closed; dropping message");
        }
    }

    /// Forwards a message to the node owning the destination bee.
    fn forward(&self, to: BeeId, mh: MsgAndHandler) {
        let registry = self.registry.clone();
        let proxies = self.proxies.clone();
        let mut msg = mh.msg;
        msg.to = Some(to.clone());
        tokio::spawn(async move {
            let Some(info) = registry.node(to.node) else {
                error!(bee = %to, node = %to.node, "no address for destination node");
                return;
            };
            if let Err(e) = proxies.proxy(&info.addr).send_msg(&msg).await {
                error!(bee = %to, addr = %info.addr, error = %e, "message forward failed");
            }
        });
    }

    async fn forward_bee_cmd(&mut self, bee: BeeId, cmd: BeeWireCmd, reply: BeeCmdReplySender) {
        // Replication traffic may address a bee the registry knows about
        // but this qee has not instantiated yet.
        if !self.bees.contains_key(&bee) && self.registry.bee(&bee).is_some() {
            if let Err(e) = self.materialize(bee.clone()) {
                let _ = reply.send(Err(e));
                return;
            }
        }
        match self.bees.get(&bee) {
            Some(handle) => {
                let stopping = matches!(cmd, BeeWireCmd::Stop);
                if handle.ctrl_tx.send((cmd, reply)).await.is_err() {
                    warn!(bee = %bee, "bee control channel closed");
                } else if stopping {
                    self.drop_bee(&bee);
                }
            }
            None => {
                let _ = reply.send(Err(HiveError::UnknownBee(bee)));
            }
        }
    }

    fn drop_bee(&mut self, bee: &BeeId) {
        self.bees.remove(bee);
        self.cells.retain(|_, owner| owner != bee);
    }

    /// Stops every bee in parallel: one-second deadline per attempt, five
    /// attempts, then the bee task is abandoned.
    async fn stop_bees(&mut self) {
        let bees: Vec<(BeeId, BeeHandle)> = self.bees.drain().collect();
        let stops = bees.into_iter().map(|(id, handle)| async move {
            for attempt in 1..=5u32 {
                let (tx, rx) = oneshot::channel();
                if handle.ctrl_tx.send((BeeWireCmd::Stop, tx)).await.is_err() {
                    return;
                }
                match tokio::time::timeout(Duration::from_secs(1), rx).await {
                    Ok(_) => return,
                    Err(_) => warn!(bee = %id, attempt, "still waiting for bee to stop"),
                }
            }
            warn!(bee = %id, "giving up on bee");
            handle.task.abort();
        });
        futures::future::join_all(stops).await;
        self.cells.clear();
    }
}
