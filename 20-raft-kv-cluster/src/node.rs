//! Raft consensus node.
//!
//! [`RaftNode`] wraps the tikv/raft `RawNode` together with the node's
//! [`KvStateMachine`]. It is driven by a single worker thread (see
//! [`crate::runtime`]): `tick` and `step` feed it, `poll_ready` drains what
//! Raft wants done and applies committed entries.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use raft::StateRole;
use slog::{o, Logger};
use tracing::{debug, warn};

use crate::command::Command;
use crate::fabric::Address;
use crate::store::KvStateMachine;
use crate::topology::NodeId;

/// raft-rs insists on an slog logger; node events are reported through
/// `tracing` by the runtime instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Tick counts that drive elections and heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct RaftTiming {
    pub election_tick: usize,
    pub heartbeat_tick: usize,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 3,
        }
    }
}

/// A committed membership change as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub node: NodeId,
    pub change_type: ConfChangeType,
    /// Fabric address carried in the entry context.
    pub address: Option<Address>,
}

/// What happened to one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedEntry {
    /// A client command reached the state machine.
    Command {
        index: u64,
        term: u64,
        command: Command,
    },
    /// A membership change was applied to the Raft configuration.
    Membership {
        index: u64,
        term: u64,
        change: MembershipChange,
    },
    /// Leader no-op, dropped proposal or undecodable payload.
    Empty { index: u64, term: u64 },
}

impl AppliedEntry {
    pub fn index(&self) -> u64 {
        match self {
            AppliedEntry::Command { index, .. }
            | AppliedEntry::Membership { index, .. }
            | AppliedEntry::Empty { index, .. } => *index,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            AppliedEntry::Command { term, .. }
            | AppliedEntry::Membership { term, .. }
            | AppliedEntry::Empty { term, .. } => *term,
        }
    }
}

/// Output from processing a Raft ready state: messages to send and entries
/// applied locally, in log order.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<AppliedEntry>,
}

/// One Raft participant: the raft-rs `RawNode`, its in-memory log and the
/// state machine committed entries are applied to.
///
/// Not thread-safe by itself; the runtime gives each node a dedicated thread.
pub struct RaftNode {
    id: NodeId,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    store: Arc<KvStateMachine>,
    voters: Vec<u64>,
    applied_index: u64,
    /// Index of the last applied configuration change (0 = bootstrap).
    conf_index: u64,
}

impl RaftNode {
    /// Creates a node whose initial configuration is `voters`.
    ///
    /// Every member of the bootstrap topology is created with the same voter
    /// set and an empty log. A re-admitted node is created the same way and
    /// catches up from index 1 through normal log replication.
    pub fn new(
        id: NodeId,
        voters: &[u64],
        store: Arc<KvStateMachine>,
        timing: RaftTiming,
    ) -> Result<Self> {
        let cfg = Config {
            id: id.raft_id(),
            election_tick: timing.election_tick,
            heartbeat_tick: timing.heartbeat_tick,
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024,
            // An empty, restarted node must not bump terms while it catches up.
            pre_vote: true,
            check_quorum: true,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            store,
            voters: voters.to_vec(),
            applied_index: 0,
            conf_index: 0,
        })
    }

    /// Advances the logical clock by one tick. Elections and heartbeats are
    /// counted in ticks, see [`RaftTiming`].
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election right away instead of waiting for the election
    /// timeout. With pre-vote enabled this begins with a pre-campaign.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current Raft role of this node.
    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Current leader's raft id, or 0 if none is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Voter ids as of the last applied configuration change.
    pub fn voters(&self) -> &[u64] {
        &self.voters
    }

    /// Index of the last entry handed to the state machine.
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn conf_index(&self) -> u64 {
        self.conf_index
    }

    /// The state machine committed commands are applied to.
    pub fn store(&self) -> &Arc<KvStateMachine> {
        &self.store
    }

    /// Appends an encoded command to the leader's log.
    ///
    /// Returns the `(index, term)` the entry was proposed at. Success means
    /// "appended", not "committed"; watch `poll_ready` for the apply.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        if self.role() != StateRole::Leader {
            bail!("{} is not the leader", self.id);
        }
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok((self.raw.raft.raft_log.last_index(), self.term()))
    }

    /// True while a configuration change is in the log but not applied yet.
    ///
    /// A fresh leader counts as pending until it has applied its first entry.
    pub fn conf_change_pending(&self) -> bool {
        self.raw.raft.pending_conf_index > self.raw.raft.raft_log.applied
    }

    /// Proposes adding `node` as a voter reachable at `address`.
    ///
    /// Raft allows one configuration change in flight; a second one is turned
    /// into an empty entry by the library, which shows up as
    /// [`AppliedEntry::Empty`] at the returned index.
    pub fn propose_add_voter(&mut self, node: NodeId, address: &Address) -> Result<(u64, u64)> {
        if self.role() != StateRole::Leader {
            bail!("{} is not the leader", self.id);
        }
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = node.raft_id();
        self.raw
            .propose_conf_change(address.as_str().as_bytes().to_vec(), cc)
            .context("propose conf change failed")?;
        Ok((self.raw.raft.raft_log.last_index(), self.term()))
    }

    /// Feeds a message from a peer into Raft.
    ///
    /// Errors for messages Raft refuses to process, such as responses from a
    /// peer it no longer tracks.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Drains one Ready/LightReady cycle.
    ///
    /// Returns `None` when Raft has nothing to do.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.storage
                .wl()
                .apply_snapshot(snapshot.clone())
                .context("apply snapshot failed")?;
            if !snapshot.data.is_empty() {
                self.store
                    .restore(&snapshot.data)
                    .context("restore state machine from snapshot failed")?;
            }
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Applies committed entries in order. Normal entries go to the state
    /// machine, configuration changes to Raft itself.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<AppliedEntry>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let (index, term) = (entry.index, entry.term);
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => AppliedEntry::Empty { index, term },
                EntryType::EntryNormal => match self.store.apply_entry(&entry.data) {
                    Ok(command) => AppliedEntry::Command {
                        index,
                        term,
                        command,
                    },
                    Err(err) => {
                        warn!(node_id = %self.id, index, error = %err, "skipping undecodable entry");
                        AppliedEntry::Empty { index, term }
                    }
                },
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    warn!(node_id = %self.id, index, "ignoring joint configuration change");
                    AppliedEntry::Empty { index, term }
                }
            };
            self.applied_index = index;
            applied.push(outcome);
        }
        Ok(applied)
    }

    /// Applies a committed `ConfChange` and records the new voter set in
    /// storage. The entry context carries the target's fabric address.
    fn apply_conf_change(&mut self, entry: &Entry) -> Result<AppliedEntry> {
        let (index, term) = (entry.index, entry.term);
        if entry.data.is_empty() {
            return Ok(AppliedEntry::Empty { index, term });
        }
        let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;
        let conf_state = self
            .raw
            .apply_conf_change(&cc)
            .context("apply conf change failed")?;
        self.voters = conf_state.voters.clone();
        self.storage.wl().set_conf_state(conf_state);
        self.conf_index = index;

        let target = cc.node_id;
        let change_type = cc.change_type();
        if change_type == ConfChangeType::AddNode
            && self.role() == StateRole::Leader
            && target != self.id.raft_id()
        {
            // A re-added voter may have come back with an empty log; probe it
            // from the start instead of trusting the old match index.
            if let Some(progress) = self.raw.raft.mut_prs().get_mut(target) {
                progress.matched = 0;
                progress.become_probe();
            }
        }

        let address = String::from_utf8(entry.context.to_vec())
            .ok()
            .filter(|addr| !addr.is_empty())
            .map(|addr| Address::from(addr.as_str()));
        debug!(node_id = %self.id, index, target, ?change_type, "applied conf change");
        Ok(AppliedEntry::Membership {
            index,
            term,
            change: MembershipChange {
                node: NodeId::new(target),
                change_type,
                address,
            },
        })
    }
}
