//! The hive: process-wide coordinator.
//!
//! Owns the qees, the listener, and the consensus engine. The main loop
//! routes inbound messages (unicast to the owning bee's node, broadcast to
//! every app handling the kind) and serves control commands. Stop cascades:
//! listener, bees (per-bee deadline), consensus.

use crate::app::{App, AppSpec, MsgAndHandler};
use crate::bee::{BeeCmdReply, BeeDeps};
use crate::config::HiveConfig;
use crate::qee::{Qee, QeeCtrl, QeeHandle};
use crate::stats::{HiveStats, HiveStatsSnapshot};
use async_trait::async_trait;
use hivemind_codec::PayloadRegistry;
use hivemind_consensus::{ConsensusConfig, ConsensusNode, RaftMessage, RaftTransport};
use hivemind_network::{
    bind, CmdData, CmdResult, HiveWireCmd, ProxyPool, RemoteCmd, ServerChannels,
};
use hivemind_registry::{Registry, RegistryCommand, RegistryReply};
use hivemind_types::{
    AppName, BeeId, HiveError, Message, NodeId, NodeInfo, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TICK_PERIOD: Duration = Duration::from_millis(10);
const BARRIER_RETRY: Duration = Duration::from_millis(50);
const BARRIER_ATTEMPTS: u32 = 600;

pub(crate) enum HiveCtrl {
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Remote {
        cmd: RemoteCmd,
        reply: oneshot::Sender<CmdResult>,
    },
}

/// Identity persisted across restarts: who this node is and who it knew.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HiveMeta {
    info: NodeInfo,
    peers: Vec<NodeInfo>,
}

/// A hive under construction: register apps and payloads, then `start`.
pub struct Hive {
    config: Arc<HiveConfig>,
    codec: Arc<PayloadRegistry>,
    registry: Arc<Registry>,
    stats: Arc<HiveStats>,
    node_id: Arc<OnceLock<NodeId>>,
    apps: HashMap<AppName, App>,
    data_tx: mpsc::Sender<Message>,
    data_rx: mpsc::Receiver<Message>,
    ctrl_tx: mpsc::Sender<HiveCtrl>,
    ctrl_rx: mpsc::Receiver<HiveCtrl>,
}

impl Hive {
    pub fn new(config: HiveConfig) -> Self {
        let (data_tx, data_rx) = mpsc::channel(config.data_ch_buf_size);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(config.cmd_ch_buf_size);
        Self {
            config: Arc::new(config),
            codec: Arc::new(PayloadRegistry::new()),
            registry: Arc::new(Registry::new()),
            stats: Arc::new(HiveStats::default()),
            node_id: Arc::new(OnceLock::new()),
            apps: HashMap::new(),
            data_tx,
            data_rx,
            ctrl_tx,
            ctrl_rx,
        }
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    /// Creates (or returns) the app with the given name. Apps become active
    /// when the hive starts.
    pub fn new_app(&mut self, name: impl Into<AppName>) -> &mut App {
        let name = name.into();
        self.apps
            .entry(name.clone())
            .or_insert_with(|| App::new(name))
    }

    /// Registers a payload type under its wire tag. Must happen before any
    /// emit of that type; registering twice is idempotent.
    pub fn register_payload<T: 'static>(&self, tag: &str) -> Result<()> {
        self.codec.register::<T>(tag)
    }

    /// A cloneable handle for emitting, sending commands, and stopping the
    /// hive while `start` runs.
    pub fn handle(&self) -> HiveHandle {
        HiveHandle {
            data_tx: self.data_tx.clone(),
            ctrl_tx: self.ctrl_tx.clone(),
            codec: self.codec.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            node_id: self.node_id.clone(),
        }
    }

    /// Starts the hive and blocks until it stops. Clean stop returns `Ok`.
    pub async fn start(self) -> Result<()> {
        let cfg = self.config.clone();
        std::fs::create_dir_all(&cfg.state_path)
            .map_err(|e| HiveError::fatal(format!("cannot create state path: {e}")))?;

        let proxies = Arc::new(ProxyPool::new()?);
        let meta = load_or_join(&cfg, &proxies).await?;
        let id = meta.info.id;
        let _ = self.node_id.set(id);
        info!(node = %id, addr = %cfg.addr, "hive starting");

        spawn_signal_watcher(self.ctrl_tx.clone());

        // Consensus engine (the barrier comes after the listener is up).
        let (tick_rx, tick_task) = spawn_ticker(TICK_PERIOD);
        let transport = Arc::new(HiveRaftTransport {
            proxies: proxies.clone(),
            registry: self.registry.clone(),
            seeds: meta
                .peers
                .iter()
                .map(|p| (p.id, p.addr.clone()))
                .collect(),
        });
        let consensus = ConsensusNode::start(
            id,
            meta.peers.clone(),
            ConsensusConfig::default(),
            transport,
            self.registry.clone(),
            &cfg.state_path,
            tick_rx,
        )?;

        // Qees, one per app.
        let mut qees: HashMap<AppName, (Arc<AppSpec>, QeeHandle)> = HashMap::new();
        for (name, app) in &self.apps {
            let spec = app.freeze();
            let deps = BeeDeps {
                hive_data_tx: self.data_tx.clone(),
                codec: self.codec.clone(),
                registry: self.registry.clone(),
                proxies: proxies.clone(),
                quorum: cfg.replication_quorum,
                stats: self.stats.clone(),
                data_buf: cfg.data_ch_buf_size,
                cmd_buf: cfg.cmd_ch_buf_size,
            };
            let handle = Qee::spawn(
                id,
                spec.clone(),
                &cfg,
                consensus.clone(),
                self.registry.clone(),
                proxies.clone(),
                deps,
            );
            qees.insert(name.clone(), (spec, handle));
        }

        // Listener for the v1 protocol.
        let (server_cmd_tx, server_cmd_rx) = mpsc::channel(cfg.cmd_ch_buf_size);
        let (raft_in_tx, mut raft_in_rx) = mpsc::unbounded_channel();
        let (server_shutdown, shutdown_rx) = oneshot::channel();
        let (_bound, server_task) = bind(
            &cfg.addr,
            ServerChannels {
                msg_tx: self.data_tx.clone(),
                cmd_tx: server_cmd_tx,
                raft_tx: raft_in_tx,
            },
            shutdown_rx,
        )
        .await?;
        let raft_pump = {
            let consensus = consensus.clone();
            tokio::spawn(async move {
                while let Some(msg) = raft_in_rx.recv().await {
                    consensus.step(msg);
                }
            })
        };

        // NoOp barrier: confirms this node is in sync with the cluster.
        barrier(&consensus).await?;
        if let Err(e) = consensus
            .process(RegistryCommand::AddNode {
                info: meta.info.clone(),
            })
            .await
        {
            warn!(error = %e, "directory registration failed");
        }
        info!(node = %id, "in sync with the cluster");

        // Rebuild bees this node owned before restarting.
        for bee in self.registry.bees_of_node(id) {
            let Some((_, qee)) = qees.get(&bee.app) else {
                error!(bee = %bee, "owned bee belongs to an unregistered app");
                continue;
            };
            let (tx, rx) = oneshot::channel();
            if qee
                .ctrl_tx
                .send(QeeCtrl::ReloadBee {
                    id: bee.clone(),
                    reply: tx,
                })
                .await
                .is_ok()
            {
                if let Ok(Err(e)) = rx.await {
                    error!(bee = %bee, error = %e, "cannot reload bee");
                }
            }
        }

        let mut running = RunningHive {
            id,
            registry: self.registry,
            proxies,
            stats: self.stats,
            qees,
            consensus,
            data_rx: self.data_rx,
            ctrl_rx: self.ctrl_rx,
            server_cmd_rx,
            server_shutdown: Some(server_shutdown),
            server_task,
            tick_task,
            raft_pump,
        };
        running.run().await
    }
}

/// Cloneable front door to a running hive.
#[derive(Clone)]
pub struct HiveHandle {
    data_tx: mpsc::Sender<Message>,
    ctrl_tx: mpsc::Sender<HiveCtrl>,
    codec: Arc<PayloadRegistry>,
    registry: Arc<Registry>,
    stats: Arc<HiveStats>,
    node_id: Arc<OnceLock<NodeId>>,
}

impl HiveHandle {
    /// Broadcasts a registered payload from this hive (no sender).
    pub async fn emit<T: serde::Serialize + 'static>(&self, data: T) -> Result<()> {
        let (kind, payload) = self.codec.encode(&data)?;
        self.send(Message::broadcast(kind, payload)).await
    }

    /// Sends a registered payload to a specific bee.
    pub async fn send_to_bee<T: serde::Serialize + 'static>(
        &self,
        data: T,
        to: BeeId,
    ) -> Result<()> {
        let (kind, payload) = self.codec.encode(&data)?;
        self.send(Message::unicast(kind, payload, to)).await
    }

    /// Replies to a message's sender; fails on no-reply messages.
    pub async fn reply_to<T: serde::Serialize + 'static>(
        &self,
        msg: &Message,
        data: T,
    ) -> Result<()> {
        let to = msg
            .from
            .clone()
            .ok_or_else(|| HiveError::invalid_state("cannot reply to a no-reply message"))?;
        self.send_to_bee(data, to).await
    }

    /// Round-trips a ping through the control loop; returns once the hive
    /// has started serving.
    pub async fn ping(&self) -> Result<()> {
        self.command(HiveWireCmd::Ping).await.map(|_| ())
    }

    pub async fn live_hives(&self) -> Result<Vec<NodeInfo>> {
        match self.command(HiveWireCmd::LiveHives).await? {
            Some(CmdData::Nodes(nodes)) => Ok(nodes),
            other => Err(HiveError::fatal(format!(
                "unexpected live-hives reply: {other:?}"
            ))),
        }
    }

    /// Stops the hive; resolves once the stop cascade finished.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ctrl_tx
            .send(HiveCtrl::Stop { reply: tx })
            .await
            .map_err(|_| HiveError::invalid_state("hive is already stopped"))?;
        rx.await
            .map_err(|_| HiveError::invalid_state("hive is already stopped"))?
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id.get().copied()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> HiveStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn register_payload<T: 'static>(&self, tag: &str) -> Result<()> {
        self.codec.register::<T>(tag)
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.data_tx
            .send(msg)
            .await
            .map_err(|_| HiveError::invalid_state("hive is stopped"))
    }

    async fn command(&self, cmd: HiveWireCmd) -> Result<Option<CmdData>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl_tx
            .send(HiveCtrl::Remote {
                cmd: RemoteCmd::ToHive { cmd },
                reply: tx,
            })
            .await
            .map_err(|_| HiveError::invalid_state("hive is stopped"))?;
        rx.await
            .map_err(|_| HiveError::invalid_state("hive is stopped"))?
            .into_result()
    }
}

struct RunningHive {
    id: NodeId,
    registry: Arc<Registry>,
    proxies: Arc<ProxyPool>,
    stats: Arc<HiveStats>,
    qees: HashMap<AppName, (Arc<AppSpec>, QeeHandle)>,
    consensus: ConsensusNode,
    data_rx: mpsc::Receiver<Message>,
    ctrl_rx: mpsc::Receiver<HiveCtrl>,
    server_cmd_rx: mpsc::Receiver<(RemoteCmd, oneshot::Sender<CmdResult>)>,
    server_shutdown: Option<oneshot::Sender<()>>,
    server_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
    raft_pump: JoinHandle<()>,
}

impl RunningHive {
    async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                msg = self.data_rx.recv() => match msg {
                    Some(msg) => self.route_msg(msg).await,
                    None => return Err(HiveError::invalid_state("data channel closed")),
                },
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(HiveCtrl::Stop { reply }) => {
                        let result = self.stop_cascade().await;
                        let _ = reply.send(result);
                        return Ok(());
                    }
                    Some(HiveCtrl::Remote { cmd, reply }) => self.handle_remote(cmd, reply).await,
                    None => return Err(HiveError::invalid_state("control channel closed")),
                },
                cmd = self.server_cmd_rx.recv() => match cmd {
                    Some((cmd, reply)) => self.handle_remote(cmd, reply).await,
                    None => return Err(HiveError::invalid_state("listener channel closed")),
                },
            }
        }
    }

    async fn route_msg(&mut self, msg: Message) {
        HiveStats::bump(&self.stats.msgs_routed);
        match msg.to.clone() {
            Some(to) if to.node == self.id => match self.qees.get(&to.app) {
                Some((spec, qee)) => match spec.handler(&msg.kind) {
                    Some(handler) => {
                        if qee.data_tx.send(MsgAndHandler { msg, handler }).await.is_err() {
                            warn!(app = %to.app, "qee data channel closed");
                        }
                    }
                    None => warn!(app = %to.app, kind = %msg.kind, "no handler for unicast"),
                },
                None => warn!(app = %to.app, "unicast to unknown app"),
            },
            Some(to) => self.forward(to, msg),
            None => {
                for (spec, qee) in self.qees.values() {
                    if let Some(handler) = spec.handler(&msg.kind) {
                        let mh = MsgAndHandler {
                            msg: msg.clone(),
                            handler,
                        };
                        if qee.data_tx.send(mh).await.is_err() {
                            warn!(app = %spec.name, "qee data channel closed");
                        }
                    }
                }
            }
        }
    }

    /// Best-effort forward of a unicast message to its owner's node.
    fn forward(&self, to: BeeId, msg: Message) {
        HiveStats::bump(&self.stats.msgs_forwarded);
        let registry = self.registry.clone();
        let proxies = self.proxies.clone();
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

    async fn handle_remote(&mut self, cmd: RemoteCmd, reply: oneshot::Sender<CmdResult>) {
        debug!(node = %self.id, cmd = ?cmd, "handling command");
        match cmd {
            RemoteCmd::ToHive { cmd } => {
                let result = self.handle_hive_cmd(cmd).await;
                let _ = reply.send(result);
            }
            RemoteCmd::ToBee { bee, cmd } => match self.qees.get(&bee.app) {
                None => {
                    let _ = reply.send(CmdResult::from_err(HiveError::UnknownBee(bee)));
                }
                Some((_, qee)) => {
                    let (tx, rx) = oneshot::channel();
                    if qee
                        .ctrl_tx
                        .send(QeeCtrl::BeeCmd {
                            bee,
                            cmd,
                            reply: tx,
                        })
                        .await
                        .is_err()
                    {
                        let _ = reply
                            .send(CmdResult::from_err(HiveError::invalid_state("qee stopped")));
                        return;
                    }
                    tokio::spawn(async move {
                        let result = match rx.await {
                            Ok(Ok(BeeCmdReply::Done)) => CmdResult::ok(),
                            Ok(Ok(BeeCmdReply::Slaves(slaves))) => {
                                CmdResult::with_data(CmdData::Slaves(slaves))
                            }
                            Ok(Err(e)) => CmdResult::from_err(e),
                            Err(_) => {
                                CmdResult::from_err(HiveError::transient("bee reply dropped"))
                            }
                        };
                        let _ = reply.send(result);
                    });
                }
            },
        }
    }

    async fn handle_hive_cmd(&mut self, cmd: HiveWireCmd) -> CmdResult {
        match cmd {
            HiveWireCmd::Ping => CmdResult::ok(),
            HiveWireCmd::NewHiveId { addr } => {
                match self
                    .consensus
                    .process(RegistryCommand::NewNodeId { addr })
                    .await
                {
                    Ok(RegistryReply::NodeId(id)) => CmdResult::with_data(CmdData::NodeId(id)),
                    Ok(other) => CmdResult::from_err(HiveError::fatal(format!(
                        "unexpected reply to node id allocation: {other:?}"
                    ))),
                    Err(e) => CmdResult::from_err(e),
                }
            }
            HiveWireCmd::AddHive { info } => match self.consensus.add_node(info).await {
                Ok(_) => CmdResult::ok(),
                Err(e) => CmdResult::from_err(e),
            },
            HiveWireCmd::LiveHives => CmdResult::with_data(CmdData::Nodes(self.registry.nodes())),
        }
    }

    async fn stop_cascade(&mut self) -> Result<()> {
        info!(node = %self.id, "hive stopping");

        if let Some(shutdown) = self.server_shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.server_task)
            .await
            .is_err()
        {
            warn!("listener did not close in time");
            self.server_task.abort();
        }

        let stops = self
            .qees
            .drain()
            .map(|(name, (_, handle))| async move {
                let (tx, rx) = oneshot::channel();
                if handle.ctrl_tx.send(QeeCtrl::Stop { reply: tx }).await.is_ok() {
                    let _ = rx.await;
                }
                if tokio::time::timeout(Duration::from_secs(10), handle.task)
                    .await
                    .is_err()
                {
                    warn!(app = %name, "qee did not stop in time");
                }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(stops).await;

        self.consensus.stop().await;
        self.tick_task.abort();
        self.raft_pump.abort();
        info!(node = %self.id, "hive stopped");
        Ok(())
    }
}

struct HiveRaftTransport {
    proxies: Arc<ProxyPool>,
    registry: Arc<Registry>,
    /// Addresses known before the directory has them.
    seeds: HashMap<NodeId, String>,
}

#[async_trait]
impl RaftTransport for HiveRaftTransport {
    async fn send(&self, to: NodeId, msg: RaftMessage) {
        let addr = self
            .registry
            .node(to)
            .map(|info| info.addr)
            .or_else(|| self.seeds.get(&to).cloned());
        let Some(addr) = addr else {
            warn!(node = %to, "no address for consensus peer");
            return;
        };
        if let Err(e) = self.proxies.proxy(&addr).send_raft(&msg).await {
            debug!(node = %to, addr = %addr, error = %e, "consensus send failed");
        }
    }
}

/// Loads the persisted identity, or acquires one from a seed peer on first
/// start. The very first node of a cluster takes id 1.
async fn load_or_join(cfg: &HiveConfig, proxies: &Arc<ProxyPool>) -> Result<HiveMeta> {
    let path = cfg.state_path.join("meta.bin");
    if let Ok(bytes) = std::fs::read(&path) {
        let meta: HiveMeta = hivemind_codec::decode_frame(&bytes)?;
        info!(node = %meta.info.id, "loaded node identity");
        return Ok(meta);
    }

    let seeds: Vec<&String> = cfg.peer_addrs.iter().chain(cfg.reg_addrs.iter()).collect();
    let meta = if seeds.is_empty() {
        HiveMeta {
            info: NodeInfo::new(NodeId(1), cfg.addr.clone()),
            peers: Vec::new(),
        }
    } else {
        join_via_seeds(cfg, proxies, &seeds).await?
    };

    std::fs::write(&path, hivemind_codec::encode_frame(&meta)?)
        .map_err(|e| HiveError::fatal(format!("cannot persist node identity: {e}")))?;
    Ok(meta)
}

async fn join_via_seeds(
    cfg: &HiveConfig,
    proxies: &Arc<ProxyPool>,
    seeds: &[&String],
) -> Result<HiveMeta> {
    for seed in seeds {
        let proxy = proxies.proxy(seed);
        let assigned = proxy
            .send_cmd(&RemoteCmd::ToHive {
                cmd: HiveWireCmd::NewHiveId {
                    addr: cfg.addr.clone(),
                },
            })
            .await
            .and_then(|r| r.into_result());
        let id = match assigned {
            Ok(Some(CmdData::NodeId(id))) => id,
            Ok(other) => {
                warn!(seed = %seed, reply = ?other, "unexpected join reply");
                continue;
            }
            Err(e) => {
                warn!(seed = %seed, error = %e, "cannot join via seed");
                continue;
            }
        };

        let peers = match proxy
            .send_cmd(&RemoteCmd::ToHive {
                cmd: HiveWireCmd::LiveHives,
            })
            .await
            .and_then(|r| r.into_result())
        {
            Ok(Some(CmdData::Nodes(nodes))) => {
                nodes.into_iter().filter(|p| p.id != id).collect()
            }
            _ => Vec::new(),
        };

        let info = NodeInfo::new(id, cfg.addr.clone());
        if let Err(e) = proxy
            .send_cmd(&RemoteCmd::ToHive {
                cmd: HiveWireCmd::AddHive { info: info.clone() },
            })
            .await
            .and_then(|r| r.into_result())
        {
            warn!(seed = %seed, error = %e, "membership addition failed");
        }
        info!(node = %id, seed = %seed, peers = peers.len(), "joined cluster");
        return Ok(HiveMeta { info, peers });
    }
    Err(HiveError::fatal("cannot join the cluster via any seed"))
}

async fn barrier(consensus: &ConsensusNode) -> Result<()> {
    for attempt in 0..BARRIER_ATTEMPTS {
        match consensus.process(RegistryCommand::NoOp).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "waiting for cluster sync");
                tokio::time::sleep(BARRIER_RETRY).await;
            }
            Err(e) => return Err(HiveError::fatal(format!("cannot sync with cluster: {e}"))),
        }
    }
    Err(HiveError::fatal("cluster sync barrier timed out"))
}

fn spawn_ticker(period: Duration) -> (mpsc::Receiver<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    (rx, task)
}

/// SIGINT/SIGTERM/SIGHUP/SIGQUIT all trigger a graceful stop.
fn spawn_signal_watcher(ctrl_tx: mpsc::Sender<HiveCtrl>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install signal handler");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install signal handler");
                    return;
                }
            };
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install signal handler");
                    return;
                }
            };
            let mut quit = match signal(SignalKind::quit()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install signal handler");
                    return;
                }
            };
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
                _ = hangup.recv() => {}
                _ = quit.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
        }
        info!("signal received; stopping hive");
        let (tx, _rx) = oneshot::channel();
        let _ = ctrl_tx.send(HiveCtrl::Stop { reply: tx }).await;
    });
}
