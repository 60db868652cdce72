//! Process-wide cluster: construct, serve, shut down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::controller::LifecycleController;
use crate::fabric::Fabric;
use crate::registry::{ClusterRegistry, LeaderInfo, NodeRecord, NodeStatus};
use crate::router::CommandRouter;
use crate::runtime::{spawn_node, NodeConfig};
use crate::snapshot::SnapshotStore;
use crate::store::KvStateMachine;

pub struct Cluster {
    config: Arc<ClusterConfig>,
    registry: Arc<ClusterRegistry>,
    controller: LifecycleController,
    router: CommandRouter,
}

impl Cluster {
    /// Starts every node of the configured topology and waits for the first
    /// leader. Any failure here is fatal: there is nothing to serve.
    pub async fn bootstrap(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let topology = config.topology()?;

        let snapshots = SnapshotStore::new(&config.snapshot_dir, config.retain_snapshots);
        snapshots.reset()?;

        let fabric = Fabric::new();
        let endpoints: Vec<_> = topology
            .ids()
            .iter()
            .map(|&id| {
                let (address, endpoint) = fabric.new_endpoint();
                (id, address, endpoint)
            })
            .collect();
        for (i, (_, a, _)) in endpoints.iter().enumerate() {
            for (_, b, _) in &endpoints[i + 1..] {
                fabric.connect_pair(a, b);
            }
        }

        let voters = topology.raft_ids();
        let mut records = Vec::with_capacity(endpoints.len());
        let addresses: HashMap<_, _> = endpoints
            .iter()
            .map(|(id, address, _)| (id.raft_id(), address.clone()))
            .collect();
        for (id, address, endpoint) in endpoints {
            let mut peers = addresses.clone();
            peers.remove(&id.raft_id());
            let store = Arc::new(KvStateMachine::new(id));
            let handle = spawn_node(NodeConfig {
                id,
                endpoint,
                peers,
                voters: voters.clone(),
                store: Arc::clone(&store),
                snapshots: snapshots.clone(),
                timing: config.raft_timing(),
                tick_interval: config.tick_interval,
            })
            .with_context(|| format!("failed to start {id}"))?;
            records.push(NodeRecord {
                id,
                status: NodeStatus::Running,
                handle: Some(handle),
                store,
                address: Some(address),
            });
        }

        let primary_id = topology.primary_id();
        let primary = records
            .iter()
            .find(|record| record.id == primary_id)
            .and_then(|record| record.handle.clone())
            .with_context(|| format!("{primary_id} was not started"))?;
        let registry = Arc::new(ClusterRegistry::new(topology, fabric, records));
        let cluster = Self {
            controller: LifecycleController::new(
                Arc::clone(&registry),
                Arc::clone(&config),
                snapshots,
            ),
            router: CommandRouter::new(Arc::clone(&registry), config.apply_timeout),
            registry,
            config,
        };

        primary
            .campaign(cluster.config.apply_timeout)
            .await
            .with_context(|| format!("{} failed to campaign", primary.id()))?;
        let leader = cluster
            .wait_for_leader(cluster.config.bootstrap_timeout)
            .await
            .context("cluster failed to elect a leader")?;
        info!(leader = %leader.id, term = leader.term, nodes = cluster.registry.topology().len(), "cluster bootstrapped");
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Polls the registry once per tick until some running node leads.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<LeaderInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.registry.current_leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                bail!("no leader after {timeout:?}");
            }
            sleep(self.config.tick_interval).await;
        }
    }

    /// Shuts down every running node. Failures are logged; the rest of the
    /// nodes are still stopped.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = {
            let mut records = self.registry.write().await;
            records
                .iter_mut()
                .filter_map(|record| {
                    let handle = record.handle.take()?;
                    record.status = NodeStatus::Stopping;
                    Some((record.id, handle, record.address.take()))
                })
                .collect()
        };

        for (id, handle, address) in handles {
            if let Err(err) = handle.shutdown(self.config.shutdown_timeout).await {
                warn!(node_id = %id, error = %err, "node did not shut down cleanly");
            }
            if let Some(address) = address {
                self.registry.fabric().disconnect(&address);
            }
        }

        let mut records = self.registry.write().await;
        for record in records.iter_mut() {
            record.status = NodeStatus::Stopped;
        }
        info!("all nodes stopped");
    }
}
