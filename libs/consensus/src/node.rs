//! The consensus node: roles, elections, replication, and the apply loop.

use crate::message::{EntryPayload, LogEntry, RaftMessage};
use crate::storage::{HardState, RaftStorage, SnapshotMeta};
use async_trait::async_trait;
use hivemind_registry::{Registry, RegistryCommand, RegistryResult};
use hivemind_types::{HiveError, NodeId, NodeInfo, Result};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Outbound side of the consensus protocol. Implementations resolve the
/// destination address and deliver best-effort; failures are logged, not
/// surfaced, because the protocol tolerates loss.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, to: NodeId, msg: RaftMessage);
}

/// Tunables, counted in ticks of the external tick channel (~10 ms).
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub election_tick_min: u32,
    pub election_tick_max: u32,
    pub heartbeat_tick: u32,
    /// Applied entries between registry snapshots.
    pub snapshot_threshold: u64,
    /// How long a proposer waits for commit before giving up.
    pub propose_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_tick_min: 15,
            election_tick_max: 30,
            heartbeat_tick: 3,
            snapshot_threshold: 1024,
            propose_timeout: Duration::from_secs(5),
        }
    }
}

enum Op {
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<RegistryResult>,
    },
    Step(RaftMessage),
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running consensus task.
#[derive(Clone)]
pub struct ConsensusNode {
    op_tx: mpsc::UnboundedSender<Op>,
    propose_timeout: Duration,
}

impl ConsensusNode {
    /// Loads durable state from `state_path` and spawns the consensus task.
    ///
    /// `peers` seeds the membership (the local node may be included; it is
    /// filtered out). `tick_rx` drives all timing.
    pub fn start(
        id: NodeId,
        peers: Vec<NodeInfo>,
        cfg: ConsensusConfig,
        transport: Arc<dyn RaftTransport>,
        registry: Arc<Registry>,
        state_path: &Path,
        tick_rx: mpsc::Receiver<()>,
    ) -> Result<Self> {
        let storage = RaftStorage::open(state_path)?;
        let (hard, entries, snapshot) = storage.load()?;

        let (snap_index, snap_term) = match snapshot {
            Some((meta, data)) => {
                registry.restore_snapshot(meta.index, &data)?;
                (meta.index, meta.term)
            }
            None => (0, 0),
        };

        let propose_timeout = cfg.propose_timeout;
        let peer_map: BTreeMap<NodeId, String> = peers
            .into_iter()
            .filter(|p| p.id != id)
            .map(|p| (p.id, p.addr))
            .collect();

        let timeout = rand::thread_rng().gen_range(cfg.election_tick_min..=cfg.election_tick_max);
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let core = Core {
            id,
            cfg,
            peers: peer_map,
            role: Role::Follower,
            leader: None,
            term: hard.term,
            voted_for: hard.voted_for,
            entries,
            snap_index,
            snap_term,
            commit: snap_index,
            applied: snap_index,
            next_idx: BTreeMap::new(),
            match_idx: BTreeMap::new(),
            votes: BTreeSet::new(),
            elapsed: 0,
            timeout,
            hb_elapsed: 0,
            waiters: BTreeMap::new(),
            forward_seq: 0,
            forward_waiters: HashMap::new(),
            pending_forward_results: Vec::new(),
            pending_forwards: HashMap::new(),
            registry,
            storage,
            transport,
        };
        tokio::spawn(core.run(op_rx, tick_rx));
        Ok(Self {
            op_tx,
            propose_timeout,
        })
    }

    /// Proposes a registry command and waits for its applied result.
    pub async fn process(&self, cmd: RegistryCommand) -> RegistryResult {
        self.propose(EntryPayload::Registry(cmd)).await
    }

    /// Proposes a membership addition; the node also lands in the registry
    /// directory so proxies can resolve it.
    pub async fn add_node(&self, info: NodeInfo) -> RegistryResult {
        self.propose(EntryPayload::AddPeer { info }).await
    }

    pub async fn remove_node(&self, id: NodeId) -> RegistryResult {
        self.propose(EntryPayload::RemovePeer { id }).await
    }

    /// Feeds an inbound consensus message into the engine.
    pub fn step(&self, msg: RaftMessage) {
        let _ = self.op_tx.send(Op::Step(msg));
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.op_tx.send(Op::Stop { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn propose(&self, payload: EntryPayload) -> RegistryResult {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(Op::Propose { payload, reply: tx })
            .map_err(|_| HiveError::invalid_state("consensus is stopped"))?;
        match tokio::time::timeout(self.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HiveError::transient("proposal dropped")),
            Err(_) => Err(HiveError::transient("proposal timed out")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct Core {
    id: NodeId,
    cfg: ConsensusConfig,
    peers: BTreeMap<NodeId, String>,
    role: Role,
    leader: Option<NodeId>,

    term: u64,
    voted_for: Option<NodeId>,
    /// Entries after the snapshot; entries[0].index == snap_index + 1.
    entries: Vec<LogEntry>,
    snap_index: u64,
    snap_term: u64,
    commit: u64,
    applied: u64,

    next_idx: BTreeMap<NodeId, u64>,
    match_idx: BTreeMap<NodeId, u64>,
    votes: BTreeSet<NodeId>,

    elapsed: u32,
    timeout: u32,
    hb_elapsed: u32,

    /// Local proposals awaiting apply, keyed by log index (with the term
    /// they were proposed in).
    waiters: BTreeMap<u64, (u64, oneshot::Sender<RegistryResult>)>,
    /// Follower-side proposals forwarded to the leader.
    forward_seq: u64,
    forward_waiters: HashMap<u64, oneshot::Sender<RegistryResult>>,
    /// Forward replies whose index the local apply loop has not reached yet.
    pending_forward_results: Vec<(u64, oneshot::Sender<RegistryResult>, RegistryResult)>,
    /// Leader-side bookkeeping for forwarded proposals: index → (origin, seq).
    pending_forwards: HashMap<u64, (NodeId, u64)>,

    registry: Arc<Registry>,
    storage: RaftStorage,
    transport: Arc<dyn RaftTransport>,
}

impl Core {
    async fn run(mut self, mut op_rx: mpsc::UnboundedReceiver<Op>, mut tick_rx: mpsc::Receiver<()>) {
        info!(node = %self.id, peers = self.peers.len(), "consensus node running");
        loop {
            tokio::select! {
                op = op_rx.recv() => match op {
                    Some(Op::Propose { payload, reply }) => self.handle_propose(payload, reply),
                    Some(Op::Step(msg)) => self.handle_step(msg),
                    Some(Op::Stop { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                tick = tick_rx.recv() => match tick {
                    Some(()) => self.handle_tick(),
                    None => break,
                },
            }
        }
        info!(node = %self.id, "consensus node stopped");
    }

    // ---- proposals -----------------------------------------------------

    fn handle_propose(&mut self, payload: EntryPayload, reply: oneshot::Sender<RegistryResult>) {
        match self.role {
            Role::Leader => {
                let index = self.append_local(payload);
                self.waiters.insert(index, (self.term, reply));
                self.broadcast_append();
                self.maybe_commit();
            }
            _ => match self.leader {
                Some(leader) => {
                    self.forward_seq += 1;
                    let seq = self.forward_seq;
                    self.forward_waiters.insert(seq, reply);
                    self.send(
                        leader,
                        RaftMessage::ForwardPropose {
                            from: self.id,
                            seq,
                            payload,
                        },
                    );
                }
                None => {
                    let _ = reply.send(Err(HiveError::transient("no leader elected yet")));
                }
            },
        }
    }

    fn append_local(&mut self, payload: EntryPayload) -> u64 {
        let index = self.last_index() + 1;
        let entry = LogEntry {
            term: self.term,
            index,
            payload,
        };
        if let Err(e) = self.storage.append_entries(std::slice::from_ref(&entry)) {
            error!(error = %e, "cannot persist log entry");
        }
        self.entries.push(entry);
        index
    }

    // ---- timing --------------------------------------------------------

    fn handle_tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.hb_elapsed += 1;
                if self.hb_elapsed >= self.cfg.heartbeat_tick {
                    self.hb_elapsed = 0;
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                self.elapsed += 1;
                if self.elapsed >= self.timeout {
                    self.start_election();
                }
            }
        }
    }

    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(self.id);
        self.persist_hardstate();
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_timer();
        debug!(node = %self.id, term = self.term, "starting election");

        if self.has_majority(self.votes.len()) {
            self.become_leader();
            return;
        }
        let (last_log_index, last_log_term) = (self.last_index(), self.last_term());
        for peer in self.peer_ids() {
            self.send(
                peer,
                RaftMessage::RequestVote {
                    term: self.term,
                    candidate: self.id,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    fn become_leader(&mut self) {
        info!(node = %self.id, term = self.term, "elected leader");
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.hb_elapsed = 0;
        let next = self.last_index() + 1;
        self.next_idx = self.peer_ids().into_iter().map(|p| (p, next)).collect();
        self.match_idx = self.peer_ids().into_iter().map(|p| (p, 0)).collect();
        // A fresh entry in the new term lets earlier entries commit.
        self.append_local(EntryPayload::Registry(RegistryCommand::NoOp));
        self.broadcast_append();
        self.maybe_commit();
    }

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        let was_leader = self.role == Role::Leader;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hardstate();
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.reset_election_timer();
        if was_leader {
            for (_, (_, waiter)) in std::mem::take(&mut self.waiters) {
                let _ = waiter.send(Err(HiveError::transient("leadership lost")));
            }
            self.pending_forwards.clear();
        }
    }

    fn reset_election_timer(&mut self) {
        self.elapsed = 0;
        self.timeout = rand::thread_rng()
            .gen_range(self.cfg.election_tick_min..=self.cfg.election_tick_max);
    }

    // ---- inbound messages ----------------------------------------------

    fn handle_step(&mut self, msg: RaftMessage) {
        if let Some(term) = msg.term() {
            if term > self.term {
                self.become_follower(term, None);
            }
        }
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => self.on_request_vote(term, candidate, last_log_index, last_log_term),
            RaftMessage::RequestVoteReply { term, from, granted } => {
                self.on_vote_reply(term, from, granted)
            }
            RaftMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesReply {
                term,
                from,
                success,
                match_index,
            } => self.on_append_reply(term, from, success, match_index),
            RaftMessage::InstallSnapshot {
                term,
                leader,
                meta,
                data,
            } => self.on_install_snapshot(term, leader, meta, data),
            RaftMessage::ForwardPropose { from, seq, payload } => {
                self.on_forward_propose(from, seq, payload)
            }
            RaftMessage::ForwardReply { seq, index, result } => {
                self.on_forward_reply(seq, index, result)
            }
        }
    }

    fn on_request_vote(
        &mut self,
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        let up_to_date = (last_log_term, last_log_index) >= (self.last_term(), self.last_index());
        let granted = term >= self.term
            && up_to_date
            && (self.voted_for.is_none() || self.voted_for == Some(candidate));
        if granted {
            self.voted_for = Some(candidate);
            self.persist_hardstate();
            self.reset_election_timer();
        }
        debug!(node = %self.id, %candidate, term, granted, "vote requested");
        self.send(
            candidate,
            RaftMessage::RequestVoteReply {
                term: self.term,
                from: self.id,
                granted,
            },
        );
    }

    fn on_vote_reply(&mut self, term: u64, from: NodeId, granted: bool) {
        if self.role != Role::Candidate || term < self.term {
            return;
        }
        if granted {
            self.votes.insert(from);
            if self.has_majority(self.votes.len()) {
                self.become_leader();
            }
        }
    }

    fn on_append_entries(
        &mut self,
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        mut entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        if term < self.term {
            self.send(
                leader,
                RaftMessage::AppendEntriesReply {
                    term: self.term,
                    from: self.id,
                    success: false,
                    match_index: 0,
                },
            );
            return;
        }
        self.become_follower(term, Some(leader));

        // Entries at or below the snapshot are already committed here.
        entries.retain(|e| e.index > self.snap_index);
        let prev_ok = prev_log_index <= self.snap_index
            || (prev_log_index <= self.last_index()
                && self.term_at(prev_log_index) == Some(prev_log_term));
        if !prev_ok {
            self.send(
                leader,
                RaftMessage::AppendEntriesReply {
                    term: self.term,
                    from: self.id,
                    success: false,
                    match_index: self.snap_index,
                },
            );
            return;
        }

        let mut rewrite = false;
        for entry in entries {
            match self.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    // Conflicting suffix: drop it and everything after.
                    let keep = (entry.index - self.snap_index - 1) as usize;
                    self.entries.truncate(keep);
                    self.entries.push(entry);
                    rewrite = true;
                }
                None => {
                    self.entries.push(entry);
                    rewrite = true;
                }
            }
        }
        if rewrite {
            if let Err(e) = self.storage.rewrite_log(&self.entries) {
                error!(error = %e, "cannot persist log");
            }
        }

        let match_index = self.last_index();
        if leader_commit > self.commit {
            self.commit = leader_commit.min(match_index);
            self.apply_committed();
        }
        self.send(
            leader,
            RaftMessage::AppendEntriesReply {
                term: self.term,
                from: self.id,
                success: true,
                match_index,
            },
        );
    }

    fn on_append_reply(&mut self, term: u64, from: NodeId, success: bool, match_index: u64) {
        if self.role != Role::Leader || term < self.term {
            return;
        }
        if success {
            self.match_idx.insert(from, match_index);
            self.next_idx.insert(from, match_index + 1);
            self.maybe_commit();
        } else {
            // Back off one step at a time; the follower's reply carries its
            // snapshot index as a floor.
            let next = self.next_idx.entry(from).or_insert(1);
            *next = (*next).saturating_sub(1).max(match_index + 1).max(1);
            self.send_append(from);
        }
    }

    fn on_install_snapshot(&mut self, term: u64, leader: NodeId, meta: SnapshotMeta, data: Vec<u8>) {
        if term < self.term {
            return;
        }
        self.become_follower(term, Some(leader));
        if meta.index <= self.snap_index {
            return;
        }
        if let Err(e) = self.registry.restore_snapshot(meta.index, &data) {
            error!(error = %e, "cannot restore snapshot");
            return;
        }
        self.entries.retain(|e| e.index > meta.index);
        self.snap_index = meta.index;
        self.snap_term = meta.term;
        self.commit = self.commit.max(meta.index);
        self.applied = meta.index;
        if let Err(e) = self
            .storage
            .save_snapshot(meta, &data)
            .and_then(|_| self.storage.rewrite_log(&self.entries))
        {
            error!(error = %e, "cannot persist snapshot");
        }
        info!(node = %self.id, index = meta.index, "installed snapshot");
        self.send(
            leader,
            RaftMessage::AppendEntriesReply {
                term: self.term,
                from: self.id,
                success: true,
                match_index: self.last_index(),
            },
        );
    }

    fn on_forward_propose(&mut self, from: NodeId, seq: u64, payload: EntryPayload) {
        if self.role != Role::Leader {
            self.send(
                from,
                RaftMessage::ForwardReply {
                    seq,
                    index: 0,
                    result: Err(HiveError::transient("not the leader")),
                },
            );
            return;
        }
        let index = self.append_local(payload);
        self.pending_forwards.insert(index, (from, seq));
        self.broadcast_append();
        self.maybe_commit();
    }

    fn on_forward_reply(&mut self, seq: u64, index: u64, result: RegistryResult) {
        let Some(waiter) = self.forward_waiters.remove(&seq) else {
            return;
        };
        if result.is_err() || self.applied >= index {
            let _ = waiter.send(result);
        } else {
            // Hold the reply until our own apply loop reaches the index, so
            // the caller observes a caught-up local snapshot.
            self.pending_forward_results.push((index, waiter, result));
        }
    }

    // ---- replication & apply -------------------------------------------

    fn broadcast_append(&mut self) {
        for peer in self.peer_ids() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let next = *self.next_idx.get(&to).unwrap_or(&(self.last_index() + 1));
        if next <= self.snap_index {
            let data = match self.registry.encode_snapshot() {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "cannot encode snapshot");
                    return;
                }
            };
            self.send(
                to,
                RaftMessage::InstallSnapshot {
                    term: self.term,
                    leader: self.id,
                    meta: SnapshotMeta {
                        index: self.snap_index,
                        term: self.snap_term,
                    },
                    data,
                },
            );
            return;
        }
        let prev_log_index = next - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(self.snap_term);
        let from = (next - self.snap_index - 1) as usize;
        let entries: Vec<LogEntry> = self.entries[from..]
            .iter()
            .take(64)
            .cloned()
            .collect();
        self.send(
            to,
            RaftMessage::AppendEntries {
                term: self.term,
                leader: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit,
            },
        );
    }

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut candidate = self.last_index();
        while candidate > self.commit {
            let replicated = 1 + self
                .match_idx
                .values()
                .filter(|&&m| m >= candidate)
                .count();
            if self.has_majority(replicated) && self.term_at(candidate) == Some(self.term) {
                self.commit = candidate;
                break;
            }
            candidate -= 1;
        }
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        while self.applied < self.commit {
            let index = self.applied + 1;
            let entry = match self.entry_at(index) {
                Some(entry) => entry.clone(),
                None => {
                    error!(index, "committed entry missing from log");
                    return;
                }
            };
            let result = match &entry.payload {
                EntryPayload::Registry(cmd) => self.registry.apply(index, cmd),
                EntryPayload::AddPeer { info } => {
                    if info.id != self.id {
                        self.peers.insert(info.id, info.addr.clone());
                        if self.role == Role::Leader {
                            let next = self.last_index() + 1;
                            self.next_idx.entry(info.id).or_insert(next);
                            self.match_idx.entry(info.id).or_insert(0);
                        }
                    }
                    self.registry.apply(
                        index,
                        &RegistryCommand::AddNode { info: info.clone() },
                    )
                }
                EntryPayload::RemovePeer { id } => {
                    self.peers.remove(id);
                    self.next_idx.remove(id);
                    self.match_idx.remove(id);
                    self.registry.apply(index, &RegistryCommand::NoOp)
                }
            };
            self.applied = index;

            if let Some((term, waiter)) = self.waiters.remove(&index) {
                let outcome = if term == entry.term {
                    result.clone()
                } else {
                    Err(HiveError::transient("entry superseded by a new leader"))
                };
                let _ = waiter.send(outcome);
            }
            if let Some((from, seq)) = self.pending_forwards.remove(&index) {
                self.send(
                    from,
                    RaftMessage::ForwardReply {
                        seq,
                        index,
                        result: result.clone(),
                    },
                );
            }
            let applied = self.applied;
            let mut i = 0;
            while i < self.pending_forward_results.len() {
                if self.pending_forward_results[i].0 <= applied {
                    let (_, waiter, result) = self.pending_forward_results.swap_remove(i);
                    let _ = waiter.send(result);
                } else {
                    i += 1;
                }
            }
        }
        self.maybe_compact();
    }

    fn maybe_compact(&mut self) {
        if self.applied - self.snap_index < self.cfg.snapshot_threshold {
            return;
        }
        let meta = SnapshotMeta {
            index: self.applied,
            term: self.term_at(self.applied).unwrap_or(self.snap_term),
        };
        let data = match self.registry.encode_snapshot() {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "cannot encode snapshot");
                return;
            }
        };
        if let Err(e) = self.storage.save_snapshot(meta, &data) {
            error!(error = %e, "cannot save snapshot");
            return;
        }
        self.entries.retain(|e| e.index > meta.index);
        self.snap_index = meta.index;
        self.snap_term = meta.term;
        if let Err(e) = self.storage.rewrite_log(&self.entries) {
            error!(error = %e, "cannot compact log");
        }
        info!(node = %self.id, index = meta.index, "compacted log");
    }

    // ---- helpers -------------------------------------------------------

    fn last_index(&self) -> u64 {
        self.snap_index + self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.snap_term)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snap_index {
            return Some(self.snap_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snap_index {
            return None;
        }
        self.entries.get((index - self.snap_index - 1) as usize)
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    fn has_majority(&self, count: usize) -> bool {
        count * 2 > self.peers.len() + 1
    }

    fn persist_hardstate(&self) {
        let hard = HardState {
            term: self.term,
            voted_for: self.voted_for,
        };
        if let Err(e) = self.storage.save_hardstate(&hard) {
            error!(error = %e, "cannot persist hard state");
        }
    }

    fn send(&self, to: NodeId, msg: RaftMessage) {
        if to == self.id {
            warn!(node = %self.id, "dropping self-addressed consensus message");
            return;
        }
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.send(to, msg).await;
        });
    }
}
