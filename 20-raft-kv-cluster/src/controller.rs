//! Quorum-aware stop and start of individual nodes.
//!
//! Both operations follow the same shape: validate and reserve the record
//! under the registry write lock, release the lock for every consensus call,
//! then re-acquire it to commit or roll back. A reserved record
//! (`Stopping`/`Starting`) rejects further lifecycle calls with `NodeBusy`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::fabric::Address;
use crate::registry::{find_mut, running_in, ClusterRegistry, NodeStatus};
use crate::runtime::{spawn_node, ConsensusHandle, NodeConfig};
use crate::snapshot::SnapshotStore;
use crate::store::KvStateMachine;
use crate::topology::NodeId;

#[derive(Clone)]
pub struct LifecycleController {
    registry: Arc<ClusterRegistry>,
    config: Arc<ClusterConfig>,
    snapshots: SnapshotStore,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        config: Arc<ClusterConfig>,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            registry,
            config,
            snapshots,
        }
    }

    /// Takes a running node out of service.
    ///
    /// The node stays in the Raft configuration; it simply stops
    /// participating. Its state is snapshotted (best effort) before the
    /// worker is shut down.
    pub async fn stop(&self, id: NodeId) -> Result<(), ClusterError> {
        let handle = {
            let mut records = self.registry.write().await;
            let running = running_in(&records);
            let topology = self.registry.topology();
            let record = find_mut(&mut records, id)?;
            match record.status {
                NodeStatus::Running => {}
                NodeStatus::Stopped => return Err(ClusterError::AlreadyStopped(id)),
                NodeStatus::Stopping | NodeStatus::Starting => {
                    return Err(ClusterError::NodeBusy(id))
                }
            }
            if !topology.can_stop(running) {
                return Err(ClusterError::QuorumViolation {
                    node: id,
                    running,
                    floor: topology.min_running(),
                });
            }
            record.status = NodeStatus::Stopping;
            record.handle.clone()
        };

        if let Some(handle) = &handle {
            match handle.snapshot(self.config.snapshot_timeout).await {
                Ok(path) => info!(node_id = %id, path = %path.display(), "pre-stop snapshot written"),
                Err(err) => warn!(node_id = %id, error = %err, "pre-stop snapshot failed, stopping anyway"),
            }

            // A failed shutdown is withdrawn; the worker is still up.
            if let Err(err) = handle.shutdown(self.config.shutdown_timeout).await {
                let mut records = self.registry.write().await;
                find_mut(&mut records, id)?.status = NodeStatus::Running;
                return Err(ClusterError::StopFailed {
                    node: id,
                    reason: format!("{err:#}"),
                });
            }
        }

        let mut records = self.registry.write().await;
        let record = find_mut(&mut records, id)?;
        if let Some(address) = record.address.take() {
            self.registry.fabric().disconnect(&address);
        }
        record.handle = None;
        record.status = NodeStatus::Stopped;
        let running = running_in(&records);
        info!(node_id = %id, running, "node stopped");
        Ok(())
    }

    /// Brings a stopped node back with an empty state machine and a new
    /// fabric address, then has the leader re-admit it as a voter.
    ///
    /// All-or-nothing: on failure the new worker is shut down and the record
    /// is stopped again.
    pub async fn start(&self, id: NodeId) -> Result<(), ClusterError> {
        let (handle, address) = {
            let mut records = self.registry.write().await;
            let running = running_in(&records);
            let topology = self.registry.topology();
            match find_mut(&mut records, id)?.status {
                NodeStatus::Stopped => {}
                NodeStatus::Running => return Err(ClusterError::AlreadyRunning(id)),
                NodeStatus::Stopping | NodeStatus::Starting => {
                    return Err(ClusterError::NodeBusy(id))
                }
            }
            if !topology.can_start(running) {
                return Err(ClusterError::InsufficientQuorum {
                    running,
                    required: topology.quorum(),
                });
            }

            // Link to every node that still owns an endpoint, including ones
            // mid-start or mid-stop. A stop that commits disconnects its
            // address; one that fails stays linked.
            let fabric = self.registry.fabric();
            let (address, endpoint) = fabric.new_endpoint();
            let mut peers = HashMap::new();
            for other in records
                .iter()
                .filter(|record| record.id != id && record.status != NodeStatus::Stopped)
            {
                if let Some(peer) = &other.address {
                    fabric.connect_pair(&address, peer);
                    peers.insert(other.id.raft_id(), peer.clone());
                }
            }

            let store = Arc::new(KvStateMachine::new(id));
            let handle = spawn_node(NodeConfig {
                id,
                endpoint,
                peers,
                voters: topology.raft_ids(),
                store: Arc::clone(&store),
                snapshots: self.snapshots.clone(),
                timing: self.config.raft_timing(),
                tick_interval: self.config.tick_interval,
            })
            .map_err(|err| {
                fabric.disconnect(&address);
                ClusterError::JoinFailed {
                    node: id,
                    reason: format!("{err:#}"),
                }
            })?;

            let record = find_mut(&mut records, id)?;
            record.status = NodeStatus::Starting;
            record.handle = Some(handle.clone());
            record.store = store;
            record.address = Some(address.clone());
            (handle, address)
        };
        info!(node_id = %id, %address, "node starting");

        let Some(leader) = self.registry.current_leader().await else {
            self.roll_back_start(id, &handle, &address).await;
            return Err(ClusterError::LeaderUnavailable(id));
        };

        if let Err(err) = leader
            .handle
            .add_voter(id, address.clone(), 0, self.config.add_voter_timeout)
            .await
        {
            self.roll_back_start(id, &handle, &address).await;
            return Err(ClusterError::JoinFailed {
                node: id,
                reason: format!("{err:#}"),
            });
        }

        let mut records = self.registry.write().await;
        find_mut(&mut records, id)?.status = NodeStatus::Running;
        let running = running_in(&records);
        info!(node_id = %id, leader = %leader.id, running, "node rejoined");
        Ok(())
    }

    async fn roll_back_start(&self, id: NodeId, handle: &ConsensusHandle, address: &Address) {
        if let Err(err) = handle.shutdown(self.config.shutdown_timeout).await {
            warn!(node_id = %id, error = %err, "failed to shut down node while rolling back start");
        }
        self.registry.fabric().disconnect(address);
        let mut records = self.registry.write().await;
        if let Ok(record) = find_mut(&mut records, id) {
            record.handle = None;
            record.address = None;
            record.status = NodeStatus::Stopped;
        }
        warn!(node_id = %id, "start rolled back");
    }
}
