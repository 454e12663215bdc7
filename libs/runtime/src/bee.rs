//! The bee: a single-threaded stateful actor owning one cell group.
//!
//! Each bee loops over a data channel of (message, handler) pairs and a
//! control channel of commands with reply sinks, processing one item at a
//! time. A handler completes (commit or abort, including the replication
//! acknowledgement) before the next message is dequeued, which gives
//! per-bee linearizability over its state and its outgoing message order.

use crate::app::MsgAndHandler;
use crate::context::RcvContext;
use crate::stats::HiveStats;
use hivemind_codec::PayloadRegistry;
use hivemind_network::{BeeWireCmd, ProxyPool, RemoteCmd};
use hivemind_registry::Registry;
use hivemind_state::TxState;
use hivemind_types::{BeeId, Colony, HiveError, Message, Result, Tx, TxStatus};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Buffered-transaction cap on a slave; oldest committed entries are pruned
/// first when it fills.
const TX_BUF_CAP: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BeeCmdReply {
    Done,
    Slaves(Vec<BeeId>),
}

pub(crate) type BeeCmdReplySender = oneshot::Sender<Result<BeeCmdReply>>;

/// Sender half of a running bee, held by its qee.
pub(crate) struct BeeHandle {
    pub id: BeeId,
    pub data_tx: mpsc::Sender<MsgAndHandler>,
    pub ctrl_tx: mpsc::Sender<(BeeWireCmd, BeeCmdReplySender)>,
    pub task: JoinHandle<()>,
}

pub(crate) struct Bee {
    id: BeeId,
    colony: Colony,
    transactional: bool,
    state: TxState,
    /// Seq of the last committed transaction; gap-free from 1.
    tx_seq: u64,
    /// Replicated transactions buffered on this bee as a slave.
    tx_buf: Vec<Tx>,
    data_rx: mpsc::Receiver<MsgAndHandler>,
    ctrl_rx: mpsc::Receiver<(BeeWireCmd, BeeCmdReplySender)>,
    hive_data_tx: mpsc::Sender<Message>,
    codec: Arc<PayloadRegistry>,
    registry: Arc<Registry>,
    proxies: Arc<ProxyPool>,
    quorum: usize,
    stats: Arc<HiveStats>,
}

pub(crate) struct BeeDeps {
    pub hive_data_tx: mpsc::Sender<Message>,
    pub codec: Arc<PayloadRegistry>,
    pub registry: Arc<Registry>,
    pub proxies: Arc<ProxyPool>,
    pub quorum: usize,
    pub stats: Arc<HiveStats>,
    pub data_buf: usize,
    pub cmd_buf: usize,
}

impl Bee {
    pub fn spawn(id: BeeId, colony: Colony, transactional: bool, deps: &BeeDeps) -> BeeHandle {
        let (data_tx, data_rx) = mpsc::channel(deps.data_buf);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(deps.cmd_buf);
        let bee = Bee {
            id: id.clone(),
            colony,
            transactional,
            state: TxState::default(),
            tx_seq: 0,
            tx_buf: Vec::new(),
            data_rx,
            ctrl_rx,
            hive_data_tx: deps.hive_data_tx.clone(),
            codec: deps.codec.clone(),
            registry: deps.registry.clone(),
            proxies: deps.proxies.clone(),
            quorum: deps.quorum,
            stats: deps.stats.clone(),
        };
        HiveStats::bump(&deps.stats.bees_spawned);
        let task = tokio::spawn(bee.run());
        BeeHandle {
            id,
            data_tx,
            ctrl_tx,
            task,
        }
    }

    async fn run(mut self) {
        debug!(bee = %self.id, "bee running");
        loop {
            tokio::select! {
                mh = self.data_rx.recv() => match mh {
                    Some(mh) => self.handle_msg(mh).await,
                    None => break,
                },
                cmd = self.ctrl_rx.recv() => match cmd {
                    Some((cmd, reply)) => {
                        if !self.handle_cmd(cmd, reply) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(bee = %self.id, "bee stopped");
    }

    async fn handle_msg(&mut self, mh: MsgAndHandler) {
        if self.transactional {
            if let Err(e) = self.state.begin_tx() {
                error!(bee = %self.id, error = %e, "cannot open transaction");
                return;
            }
        }

        let (outcome, outgoing) = {
            let mut ctx = RcvContext::new(
                &self.id,
                &mut self.state,
                &self.codec,
                mh.msg.from.clone(),
            );
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                mh.handler.receive(&mh.msg, &mut ctx)
            }));
            (outcome, ctx.take_outgoing())
        };

        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(bee = %self.id, kind = %mh.msg.kind, error = %e, "handler failed");
                true
            }
            Err(panic) => {
                error!(
                    bee = %self.id,
                    kind = %mh.msg.kind,
                    panic = panic_message(panic.as_ref()),
                    "handler panicked"
                );
                true
            }
        };

        if !self.transactional {
            // Emissions dispatch immediately; state changes already applied.
            self.flush(outgoing).await;
            return;
        }

        if failed {
            let _ = self.state.abort_tx();
            HiveStats::bump(&self.stats.txs_aborted);
            return;
        }

        let ops = self.state.tx();
        if ops.is_empty() && outgoing.is_empty() {
            let _ = self.state.commit_tx();
            return;
        }

        let tx = Tx::new(self.tx_seq + 1, ops, outgoing);
        if !self.colony.slaves.is_empty() {
            if let Err(e) = self.replicate(&tx).await {
                error!(bee = %self.id, seq = tx.seq, error = %e, "replication failed; aborting");
                let _ = self.state.abort_tx();
                HiveStats::bump(&self.stats.replication_failures);
                HiveStats::bump(&self.stats.txs_aborted);
                return;
            }
        }

        if let Err(e) = self.state.commit_tx() {
            error!(bee = %self.id, error = %e, "commit failed");
            return;
        }
        self.tx_seq = tx.seq;
        HiveStats::bump(&self.stats.txs_committed);
        debug!(bee = %self.id, seq = tx.seq, "committed transaction");

        self.flush(tx.msgs.clone()).await;
        self.notify_commit(tx.seq);
    }

    /// Sends BufferTx to every slave in parallel. The first
    /// `replication_quorum` slaves (in colony order) must acknowledge;
    /// failures past the quorum are logged only.
    async fn replicate(&self, tx: &Tx) -> Result<()> {
        let sends = self.colony.slaves.iter().cloned().map(|slave| {
            let registry = self.registry.clone();
            let proxies = self.proxies.clone();
            let tx = tx.clone();
            async move {
                let info = registry
                    .node(slave.node)
                    .ok_or(HiveError::UnknownNode(slave.node))?;
                let result = proxies
                    .proxy(&info.addr)
                    .send_cmd(&RemoteCmd::ToBee {
                        bee: slave,
                        cmd: BeeWireCmd::BufferTx(tx),
                    })
                    .await?;
                result.into_result().map(|_| ())
            }
        });
        let results = futures::future::join_all(sends).await;
        let required = self.quorum.min(self.colony.slaves.len());
        for (i, result) in results.iter().enumerate() {
            if let Err(e) = result {
                if i < required {
                    return Err(e.clone());
                }
                warn!(
                    bee = %self.id,
                    slave = %self.colony.slaves[i],
                    error = %e,
                    "replication to non-quorum slave failed"
                );
            }
        }
        Ok(())
    }

    /// Best-effort commit notification; not on the critical path.
    fn notify_commit(&self, seq: u64) {
        for slave in self.colony.slaves.iter().cloned() {
            let registry = self.registry.clone();
            let proxies = self.proxies.clone();
            let master = self.id.clone();
            tokio::spawn(async move {
                let Some(info) = registry.node(slave.node) else {
                    warn!(bee = %master, slave = %slave, "no address for commit notify");
                    return;
                };
                let outcome = proxies
                    .proxy(&info.addr)
                    .send_cmd(&RemoteCmd::ToBee {
                        bee: slave.clone(),
                        cmd: BeeWireCmd::CommitTx(seq),
                    })
                    .await
                    .and_then(|r| r.into_result().map(|_| ()));
                if let Err(e) = outcome {
                    warn!(bee = %master, slave = %slave, seq, error = %e, "commit notify failed");
                }
            });
        }
    }

    async fn flush(&self, msgs: Vec<Message>) {
        for msg in msgs {
            if self.hive_data_tx.send(msg).await.is_err() {
                warn!(bee = %self.id, "hive data channel closed; dropping emission");
            }
        }
    }

    /// Returns false when the bee should exit.
    fn handle_cmd(&mut self, cmd: BeeWireCmd, reply: BeeCmdReplySender) -> bool {
        match cmd {
            BeeWireCmd::Stop => {
                let _ = reply.send(Ok(BeeCmdReply::Done));
                false
            }
            BeeWireCmd::ListSlaves => {
                let _ = reply.send(Ok(BeeCmdReply::Slaves(self.colony.slaves.clone())));
                true
            }
            BeeWireCmd::AddSlave(id) => {
                let result = if self.colony.add_slave(id.clone()) {
                    Ok(BeeCmdReply::Done)
                } else {
                    Err(HiveError::conflict(format!(
                        "{id} is already a slave of {}",
                        self.id
                    )))
                };
                let _ = reply.send(result);
                true
            }
            BeeWireCmd::DelSlave(id) => {
                let result = if self.colony.del_slave(&id) {
                    Ok(BeeCmdReply::Done)
                } else {
                    Err(HiveError::conflict(format!(
                        "{id} is not a slave of {}",
                        self.id
                    )))
                };
                let _ = reply.send(result);
                true
            }
            BeeWireCmd::BufferTx(tx) => {
                debug!(bee = %self.id, seq = tx.seq, "buffered replicated transaction");
                if self.tx_buf.len() >= TX_BUF_CAP {
                    self.prune_tx_buf();
                }
                self.tx_buf.push(tx);
                let _ = reply.send(Ok(BeeCmdReply::Done));
                true
            }
            BeeWireCmd::CommitTx(seq) => {
                let result = match self.tx_buf.iter_mut().find(|tx| tx.seq == seq) {
                    Some(tx) => {
                        tx.status = TxStatus::Committed;
                        debug!(bee = %self.id, seq, "marked buffered transaction committed");
                        Ok(BeeCmdReply::Done)
                    }
                    None => Err(HiveError::invalid_state(format!(
                        "transaction #{seq} is not buffered on {}",
                        self.id
                    ))),
                };
                let _ = reply.send(result);
                true
            }
        }
    }

    /// Evicts the oldest committed entry, or the oldest entry outright when
    /// nothing is committed, so lost commit notifications cannot grow the
    /// buffer without bound.
    fn prune_tx_buf(&mut self) {
        let at = self
            .tx_buf
            .iter()
            .position(|tx| tx.status == TxStatus::Committed)
            .unwrap_or(0);
        let evicted = self.tx_buf.remove(at);
        warn!(bee = %self.id, seq = evicted.seq, status = ?evicted.status, "evicted buffered transaction");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}
