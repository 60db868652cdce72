//! Per-node worker thread and the async handle used to drive it.
//!
//! Each node runs a dedicated OS thread that owns its [`RaftNode`] and loops
//! over three event sources with `crossbeam_channel::select!`:
//!
//! - requests from [`ConsensusHandle`] (apply, add-voter, snapshot, ...)
//! - Raft messages arriving on the node's fabric [`Endpoint`]
//! - the logical clock, ticked every `tick_interval`
//!
//! Responses travel back over `tokio::sync::oneshot` channels so request
//! handlers can await them with a timeout without blocking the executor.
//! The worker also publishes an [`EngineStatus`] on a `watch` channel after
//! every iteration, which makes role lookups non-blocking.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use raft::prelude::Message;
use raft::StateRole;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::fabric::{Address, Endpoint};
use crate::node::{AppliedEntry, RaftNode, RaftTiming};
use crate::snapshot::SnapshotStore;
use crate::store::KvStateMachine;
use crate::topology::NodeId;

/// Everything a worker needs to run one node.
pub struct NodeConfig {
    pub id: NodeId,
    pub endpoint: Endpoint,
    /// Raft id -> fabric address for the other nodes.
    pub peers: HashMap<u64, Address>,
    /// Initial voter set, identical on every node.
    pub voters: Vec<u64>,
    pub store: Arc<KvStateMachine>,
    pub snapshots: SnapshotStore,
    pub timing: RaftTiming,
    pub tick_interval: Duration,
}

/// Last state published by a node's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub role: StateRole,
    pub term: u64,
    /// Raft id of the leader this node knows about, 0 if none.
    pub leader_id: u64,
    pub applied_index: u64,
    pub voters: Vec<u64>,
    /// Set once the worker has left its loop.
    pub stopped: bool,
}

impl EngineStatus {
    pub fn is_leader(&self) -> bool {
        !self.stopped && self.role == StateRole::Leader
    }
}

/// Human-readable role name used in responses and logs.
pub fn role_name(role: StateRole) -> &'static str {
    match role {
        StateRole::Follower => "Follower",
        StateRole::Candidate => "Candidate",
        StateRole::Leader => "Leader",
        StateRole::PreCandidate => "PreCandidate",
    }
}

type Responder<T> = oneshot::Sender<Result<T>>;

enum Request {
    Apply {
        data: Vec<u8>,
        respond_to: Responder<u64>,
    },
    AddVoter {
        node: NodeId,
        address: Address,
        prev_index: u64,
        respond_to: Responder<()>,
    },
    Snapshot {
        respond_to: Responder<PathBuf>,
    },
    Campaign {
        respond_to: Responder<()>,
    },
    Shutdown {
        respond_to: Responder<()>,
    },
}

/// Cloneable handle to a running node.
///
/// All calls are bounded by the timeout the caller passes in. When the
/// caller gives up, the waiting slot in the worker is discarded on its next
/// iteration.
#[derive(Clone)]
pub struct ConsensusHandle {
    id: NodeId,
    request_tx: Sender<Request>,
    status_rx: watch::Receiver<EngineStatus>,
}

impl ConsensusHandle {
    /// The node this handle drives.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Latest published status. Never blocks on the worker.
    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    /// Whether the node last reported itself as a live leader.
    pub fn is_leader(&self) -> bool {
        self.status_rx.borrow().is_leader()
    }

    /// Receiver that wakes on every status change, e.g. to wait for a
    /// leader with `wait_for`.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    /// Replicates an encoded command. Resolves with the log index once the
    /// entry is applied on this node.
    pub async fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<u64> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Apply { data, respond_to })?;
        await_response(rx, timeout, "apply").await
    }

    /// Adds `node` at `address` as a voter. `prev_index = 0` skips the
    /// configuration-index check.
    pub async fn add_voter(
        &self,
        node: NodeId,
        address: Address,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::AddVoter {
            node,
            address,
            prev_index,
            respond_to,
        })?;
        await_response(rx, timeout, "add voter").await
    }

    /// Persists the node's state machine and returns the file written.
    pub async fn snapshot(&self, timeout: Duration) -> Result<PathBuf> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Snapshot { respond_to })?;
        await_response(rx, timeout, "snapshot").await
    }

    /// Asks the node to start an election now. Resolves once the election
    /// has started, not when it is won; watch [`Self::subscribe`] for that.
    pub async fn campaign(&self, timeout: Duration) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Campaign { respond_to })?;
        await_response(rx, timeout, "campaign").await
    }

    /// Stops the worker. Succeeds immediately if it has already exited.
    ///
    /// The worker only exits once its acknowledgement has been delivered. If
    /// the call times out first, the request is withdrawn and the node keeps
    /// running, so an `Err` always means "still up".
    ///
    /// On success the node's endpoint has been dropped, so nothing can be
    /// delivered to it anymore.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let (respond_to, mut rx) = oneshot::channel();
        if self.request_tx.send(Request::Shutdown { respond_to }).is_err() {
            return Ok(());
        }
        let acknowledged = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(_)) => true,
            // Worker exited without answering; it is gone either way.
            Ok(Err(_)) => true,
            Err(_) => {
                // After `close` the worker can no longer commit to exiting,
                // so whatever is in the channel now is the final answer.
                rx.close();
                rx.try_recv().is_ok()
            }
        };
        if !acknowledged {
            bail!("shutdown of {} timed out after {timeout:?}", self.id);
        }

        let mut status = self.status_rx.clone();
        let _ = status.wait_for(|status| status.stopped).await;
        Ok(())
    }

    fn send(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .map_err(|_| anyhow!("{} is not running", self.id))
    }
}

async fn await_response<T>(
    rx: oneshot::Receiver<Result<T>>,
    timeout: Duration,
    operation: &str,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => bail!("{operation} abandoned: node stopped before responding"),
        Err(_) => bail!("{operation} timed out after {timeout:?}"),
    }
}

/// Starts a worker thread for one node.
///
/// The node begins as a follower with an empty log and `voters` as its
/// configuration. The thread runs until [`ConsensusHandle::shutdown`] is
/// acknowledged or every handle is dropped.
pub fn spawn_node(config: NodeConfig) -> Result<ConsensusHandle> {
    let NodeConfig {
        id,
        endpoint,
        peers,
        voters,
        store,
        snapshots,
        timing,
        tick_interval,
    } = config;

    if !voters.contains(&id.raft_id()) {
        bail!("{id} missing from voter set {voters:?}");
    }

    let node = RaftNode::new(id, &voters, store, timing)?;
    let (request_tx, request_rx) = unbounded();
    let (status_tx, status_rx) = watch::channel(status_of(&node, false));

    let worker = Worker {
        node,
        endpoint,
        peers,
        snapshots,
        tick_interval,
        requests: request_rx,
        status_tx,
        pending: BTreeMap::new(),
        queued_voters: VecDeque::new(),
        last_role: StateRole::Follower,
    };

    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || worker.run())
        .with_context(|| format!("failed to spawn raft worker for {id}"))?;

    Ok(ConsensusHandle {
        id,
        request_tx,
        status_rx,
    })
}

/// Snapshot of a node's observable state for the `watch` channel.
fn status_of(node: &RaftNode, stopped: bool) -> EngineStatus {
    EngineStatus {
        node_id: node.id(),
        role: node.role(),
        term: node.term(),
        leader_id: node.leader_id(),
        applied_index: node.applied_index(),
        voters: node.voters().to_vec(),
        stopped,
    }
}

/// A proposal waiting for its entry to be applied.
struct Pending {
    term: u64,
    kind: PendingKind,
}

enum PendingKind {
    Write(Responder<u64>),
    Voter { node: NodeId, respond_to: Responder<()> },
}

impl Pending {
    fn is_closed(&self) -> bool {
        match &self.kind {
            PendingKind::Write(tx) => tx.is_closed(),
            PendingKind::Voter { respond_to, .. } => respond_to.is_closed(),
        }
    }

    fn fail(self, err: anyhow::Error) {
        match self.kind {
            PendingKind::Write(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingKind::Voter { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    fn resolve(self, index: u64, applied: &AppliedEntry) {
        let term = self.term;
        if applied.term() != term {
            self.fail(anyhow!(
                "entry {index} was overwritten in term {} before it committed",
                applied.term()
            ));
            return;
        }
        match (self.kind, applied) {
            (PendingKind::Write(tx), AppliedEntry::Command { .. }) => {
                let _ = tx.send(Ok(index));
            }
            (PendingKind::Voter { node, respond_to }, AppliedEntry::Membership { change, .. })
                if change.node == node =>
            {
                let _ = respond_to.send(Ok(()));
            }
            (kind, _) => Pending { term, kind }
                .fail(anyhow!("proposal at index {index} was dropped by raft")),
        }
    }
}

/// An add-voter request waiting for the previous configuration change.
struct QueuedVoter {
    node: NodeId,
    address: Address,
    prev_index: u64,
    respond_to: Responder<()>,
}

struct Worker {
    node: RaftNode,
    endpoint: Endpoint,
    peers: HashMap<u64, Address>,
    snapshots: SnapshotStore,
    tick_interval: Duration,
    requests: Receiver<Request>,
    status_tx: watch::Sender<EngineStatus>,
    /// Keyed by proposed log index.
    pending: BTreeMap<u64, Pending>,
    queued_voters: VecDeque<QueuedVoter>,
    last_role: StateRole,
}

impl Worker {
    fn run(mut self) {
        let id = self.node.id();
        info!(node_id = %id, address = %self.endpoint.address(), "raft worker started");

        if let Err(err) = self.event_loop() {
            error!(node_id = %id, error = ?err, "raft worker crashed");
        }

        self.fail_pending("node stopped");
        let Worker {
            node,
            endpoint,
            status_tx,
            ..
        } = self;
        // The inbox is unregistered before anyone can observe `stopped`.
        drop(endpoint);
        status_tx.send_replace(status_of(&node, true));
        info!(node_id = %id, "raft worker stopped");
    }

    /// Runs until a shutdown is acknowledged or every handle is dropped.
    fn event_loop(&mut self) -> Result<()> {
        let requests = self.requests.clone();
        let inbox = self.endpoint.inbox().clone();
        let mut last_tick = Instant::now();

        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(requests) -> req => match req {
                    Ok(req) => {
                        if self.handle_request(req) {
                            return Ok(());
                        }
                    }
                    Err(_) => return Ok(()),
                },
                recv(inbox) -> msg => {
                    if let Ok(msg) = msg {
                        self.step(msg);
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_role();
            self.propose_queued_voter();
            self.process_ready()?;
            self.pending.retain(|_, pending| !pending.is_closed());
            self.queued_voters.retain(|queued| !queued.respond_to.is_closed());
            self.publish_status();
        }
    }

    /// Returns `true` once a shutdown has been acknowledged, which ends the
    /// loop.
    fn handle_request(&mut self, req: Request) -> bool {
        match req {
            Request::Apply { data, respond_to } => match self.node.propose(data) {
                Ok((index, term)) => {
                    self.pending.insert(
                        index,
                        Pending {
                            term,
                            kind: PendingKind::Write(respond_to),
                        },
                    );
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::AddVoter {
                node,
                address,
                prev_index,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(anyhow!("{} is not the leader", self.node.id())));
                    return false;
                }
                self.queued_voters.push_back(QueuedVoter {
                    node,
                    address,
                    prev_index,
                    respond_to,
                });
            }
            Request::Snapshot { respond_to } => {
                let snapshot = self.node.store().snapshot();
                let result = self.snapshots.persist(
                    self.node.id(),
                    self.node.term(),
                    self.node.applied_index(),
                    &snapshot,
                );
                let _ = respond_to.send(result);
            }
            Request::Campaign { respond_to } => {
                let _ = respond_to.send(self.node.campaign());
            }
            Request::Shutdown { respond_to } => {
                // A caller that already gave up gets no shutdown.
                if respond_to.send(Ok(())).is_ok() {
                    return true;
                }
                warn!(node_id = %self.node.id(), "shutdown withdrawn by caller, staying up");
            }
        }
        false
    }

    /// Proposes the oldest queued voter once no other change is in flight.
    fn propose_queued_voter(&mut self) {
        if self.node.role() != StateRole::Leader || self.node.conf_change_pending() {
            return;
        }
        let Some(QueuedVoter {
            node,
            address,
            prev_index,
            respond_to,
        }) = self.queued_voters.pop_front()
        else {
            return;
        };

        let current = self.node.conf_index();
        if prev_index != 0 && prev_index != current {
            let _ = respond_to.send(Err(anyhow!(
                "configuration moved on: expected index {prev_index}, found {current}"
            )));
            return;
        }
        match self.node.propose_add_voter(node, &address) {
            Ok((index, term)) => {
                info!(node_id = %self.node.id(), target = %node, %address, index, "proposed voter");
                self.pending.insert(
                    index,
                    Pending {
                        term,
                        kind: PendingKind::Voter { node, respond_to },
                    },
                );
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    /// Drains every pending Ready: sends outbound messages, then handles
    /// the applied entries. Messages produced before a membership change
    /// still go to the old address.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg);
            }
            for applied in bundle.applied {
                self.on_applied(applied);
            }
        }
        Ok(())
    }

    /// Feeds a message into Raft. Rejections (stale or unknown peers) are
    /// not fatal to the node.
    fn step(&mut self, msg: Message) {
        let (from, msg_type) = (msg.from, msg.msg_type);
        if let Err(err) = self.node.step(msg) {
            debug!(node_id = %self.node.id(), from, msg_type, error = %err, "raft rejected message");
        }
    }

    /// Routes a message to its peer's current address, or back into Raft
    /// if it is addressed to this node.
    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.node.id().raft_id() {
            self.step(msg);
            return;
        }
        match self.peers.get(&msg.to) {
            Some(address) => self.endpoint.send(address, msg),
            None => trace!(node_id = %self.node.id(), to = msg.to, "no address for peer"),
        }
    }

    /// Learns peer addresses from membership changes and resolves the
    /// proposal waiting on this index, if any.
    fn on_applied(&mut self, applied: AppliedEntry) {
        let id = self.node.id();
        match &applied {
            AppliedEntry::Command { index, term, command } => {
                debug!(node_id = %id, index, term, key = command.key(), "applied command");
            }
            AppliedEntry::Membership { index, change, .. } => {
                if let Some(address) = &change.address {
                    if change.node != id {
                        self.peers.insert(change.node.raft_id(), address.clone());
                    }
                }
                info!(node_id = %id, index, target = %change.node, "membership updated");
            }
            AppliedEntry::Empty { .. } => {}
        }

        let index = applied.index();
        if let Some(pending) = self.pending.remove(&index) {
            pending.resolve(index, &applied);
        }
    }

    /// Logs role transitions. Losing leadership fails everything still
    /// waiting, since those entries may never commit.
    fn observe_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            node_id = %self.node.id(),
            from = role_name(self.last_role),
            to = role_name(current),
            term = self.node.term(),
            leader = self.node.leader_id(),
            "role changed"
        );
        if self.last_role == StateRole::Leader {
            self.fail_pending("leadership lost");
        }
        self.last_role = current;
    }

    /// Fails every in-flight proposal and queued add-voter request.
    fn fail_pending(&mut self, reason: &str) {
        for (index, pending) in std::mem::take(&mut self.pending) {
            pending.fail(anyhow!("{reason} before entry {index} was applied"));
        }
        for queued in self.queued_voters.drain(..) {
            let _ = queued
                .respond_to
                .send(Err(anyhow!("{reason} before {} was proposed", queued.node)));
        }
    }

    /// Publishes the current status, waking subscribers only on change.
    fn publish_status(&self) {
        let status = status_of(&self.node, false);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::fabric::Fabric;

    fn single_node(dir: &std::path::Path, tick_interval: Duration) -> Result<ConsensusHandle> {
        let fabric = Fabric::new();
        let (_, endpoint) = fabric.new_endpoint();
        let id = NodeId::new(1);
        spawn_node(NodeConfig {
            id,
            endpoint,
            peers: HashMap::new(),
            voters: vec![1],
            store: Arc::new(KvStateMachine::new(id)),
            snapshots: SnapshotStore::new(dir, 2),
            timing: RaftTiming::default(),
            tick_interval,
        })
    }

    async fn wait_for_leader(handle: &ConsensusHandle) -> Result<()> {
        let mut status = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_leader()))
            .await
            .context("no leader")??;
        Ok(())
    }

    #[tokio::test]
    async fn single_voter_applies_and_snapshots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let handle = single_node(dir.path(), Duration::from_millis(10))?;
        handle.campaign(Duration::from_secs(1)).await?;
        wait_for_leader(&handle).await?;

        let index = handle
            .apply(Command::set("a", "1").encode()?, Duration::from_secs(2))
            .await?;
        assert!(index > 0);

        let path = handle.snapshot(Duration::from_secs(2)).await?;
        let bytes = std::fs::read(path)?;
        assert_eq!(bytes, br#"{"store":{"a":"1"},"nodeID":"node1"}"#);

        handle.shutdown(Duration::from_secs(2)).await?;
        assert!(handle.status().stopped);
        Ok(())
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let handle = single_node(dir.path(), Duration::from_millis(10))?;
        handle.shutdown(Duration::from_secs(2)).await?;
        // Idempotent.
        handle.shutdown(Duration::from_secs(2)).await?;

        let data = Command::set("a", "1").encode()?;
        assert!(handle.apply(data, Duration::from_secs(1)).await.is_err());
        assert!(!handle.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn withdrawn_shutdown_leaves_node_running() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let handle = single_node(dir.path(), Duration::from_millis(10))?;
        handle.campaign(Duration::from_secs(1)).await?;
        wait_for_leader(&handle).await?;

        // Same state as a shutdown whose caller timed out: queued, but
        // nobody is listening for the acknowledgement anymore.
        let (respond_to, rx) = oneshot::channel();
        drop(rx);
        assert!(handle
            .request_tx
            .send(Request::Shutdown { respond_to })
            .is_ok());

        let index = handle
            .apply(Command::set("still", "up").encode()?, Duration::from_secs(2))
            .await?;
        assert!(index > 0);
        assert!(!handle.status().stopped);
        assert!(handle.is_leader());

        handle.shutdown(Duration::from_secs(2)).await?;
        assert!(handle.status().stopped);
        Ok(())
    }

    #[tokio::test]
    async fn follower_rejects_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Ticks are too slow for the node to ever time out and campaign.
        let handle = single_node(dir.path(), Duration::from_secs(60))?;
        let data = Command::set("a", "1").encode()?;
        assert!(!handle.is_leader());
        assert!(handle.apply(data, Duration::from_secs(1)).await.is_err());
        handle.shutdown(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[test]
    fn role_names_match_raft_roles() {
        assert_eq!(role_name(StateRole::Leader), "Leader");
        assert_eq!(role_name(StateRole::PreCandidate), "PreCandidate");
    }
}
