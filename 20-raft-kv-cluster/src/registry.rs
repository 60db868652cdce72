//! One record per logical node, behind a single registry lock.
//!
//! The lock is only held for bookkeeping. Callers copy what they need (a
//! [`ConsensusHandle`] clone, an `Arc` to the store) and release it before
//! awaiting anything on the consensus engine.

use std::sync::Arc;

use raft::StateRole;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ClusterError;
use crate::fabric::{Address, Fabric};
use crate::runtime::{role_name, ConsensusHandle};
use crate::store::KvStateMachine;
use crate::topology::{NodeId, ReplicaTopology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    /// A stop has been accepted and is in progress.
    Stopping,
    Stopped,
    /// A start has been accepted and the node is joining.
    Starting,
}

pub struct NodeRecord {
    pub id: NodeId,
    pub status: NodeStatus,
    /// `None` once the node is stopped.
    pub handle: Option<ConsensusHandle>,
    /// Replaced with a fresh instance on every start.
    pub store: Arc<KvStateMachine>,
    /// Current fabric address; `None` while stopped.
    pub address: Option<Address>,
}

impl NodeRecord {
    pub fn is_running(&self) -> bool {
        self.status == NodeStatus::Running
    }
}

/// The node currently reporting the leader role.
#[derive(Clone)]
pub struct LeaderInfo {
    pub id: NodeId,
    pub role: StateRole,
    pub term: u64,
    pub handle: ConsensusHandle,
    pub store: Arc<KvStateMachine>,
}

/// Operator-facing view of one record.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub keys: usize,
}

pub struct ClusterRegistry {
    topology: ReplicaTopology,
    fabric: Fabric,
    records: RwLock<Vec<NodeRecord>>,
}

impl ClusterRegistry {
    pub fn new(topology: ReplicaTopology, fabric: Fabric, records: Vec<NodeRecord>) -> Self {
        Self {
            topology,
            fabric,
            records: RwLock::new(records),
        }
    }

    pub fn topology(&self) -> &ReplicaTopology {
        &self.topology
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Vec<NodeRecord>> {
        self.records.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Vec<NodeRecord>> {
        self.records.write().await
    }

    pub async fn running_count(&self) -> usize {
        running_in(&self.read().await)
    }

    pub async fn status_of(&self, id: NodeId) -> Result<NodeStatus, ClusterError> {
        let records = self.read().await;
        find(&records, id).map(|record| record.status)
    }

    /// Scans running records for a leader.
    ///
    /// The answer can be stale by the time the caller uses it; re-resolve
    /// instead of caching across awaits.
    pub async fn current_leader(&self) -> Option<LeaderInfo> {
        leader_in(&self.read().await)
    }

    pub async fn views(&self) -> Vec<NodeView> {
        self.read()
            .await
            .iter()
            .map(|record| {
                let status = record.handle.as_ref().map(|handle| handle.status());
                NodeView {
                    node_id: record.id,
                    status: record.status,
                    role: status.as_ref().map(|s| role_name(s.role)),
                    term: status.as_ref().map(|s| s.term),
                    address: record.address.clone(),
                    keys: record.store.len(),
                }
            })
            .collect()
    }
}

pub fn running_in(records: &[NodeRecord]) -> usize {
    records.iter().filter(|record| record.is_running()).count()
}

pub fn find(records: &[NodeRecord], id: NodeId) -> Result<&NodeRecord, ClusterError> {
    records
        .iter()
        .find(|record| record.id == id)
        .ok_or(ClusterError::NodeNotFound(id))
}

pub fn find_mut(records: &mut [NodeRecord], id: NodeId) -> Result<&mut NodeRecord, ClusterError> {
    records
        .iter_mut()
        .find(|record| record.id == id)
        .ok_or(ClusterError::NodeNotFound(id))
}

/// Two nodes can briefly both claim leadership across a term change; the
/// higher term wins.
pub fn leader_in(records: &[NodeRecord]) -> Option<LeaderInfo> {
    records
        .iter()
        .filter(|record| record.is_running())
        .filter_map(|record| {
            let handle = record.handle.as_ref()?;
            let status = handle.status();
            status.is_leader().then(|| LeaderInfo {
                id: record.id,
                role: status.role,
                term: status.term,
                handle: handle.clone(),
                store: Arc::clone(&record.store),
            })
        })
        .max_by_key(|leader| leader.term)
}
