#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use raft_kv_cluster::fabric::Address;
use raft_kv_cluster::registry::LeaderInfo;
use raft_kv_cluster::topology::NodeId;
use raft_kv_cluster::{Cluster, ClusterConfig};
use tempfile::TempDir;

/// A five-node cluster on fast ticks. The temp dir holds its snapshots and
/// must outlive it.
pub struct TestCluster {
    pub cluster: Cluster,
    pub dir: TempDir,
}

pub fn fast_config(dir: &TempDir) -> ClusterConfig {
    ClusterConfig {
        tick_interval: Duration::from_millis(20),
        snapshot_dir: dir.path().join("snapshots"),
        ..ClusterConfig::default()
    }
}

pub async fn start_cluster() -> Result<TestCluster> {
    start_cluster_with(|_| {}).await
}

pub async fn start_cluster_with(tune: impl FnOnce(&mut ClusterConfig)) -> Result<TestCluster> {
    let dir = tempfile::tempdir()?;
    let mut config = fast_config(&dir);
    tune(&mut config);
    let cluster = Cluster::bootstrap(config).await?;
    Ok(TestCluster { cluster, dir })
}

impl TestCluster {
    pub async fn leader(&self) -> Result<LeaderInfo> {
        self.cluster.wait_for_leader(Duration::from_secs(10)).await
    }

    /// Ids of running nodes other than the current leader.
    pub async fn followers(&self) -> Result<Vec<NodeId>> {
        let leader = self.leader().await?.id;
        let records = self.cluster.registry().read().await;
        Ok(records
            .iter()
            .filter(|record| record.is_running() && record.id != leader)
            .map(|record| record.id)
            .collect())
    }

    /// Kills a node's worker without going through the controller, the way
    /// a crash would. Its record still says running.
    pub async fn crash(&self, id: NodeId) -> Result<()> {
        let handle = {
            let records = self.cluster.registry().read().await;
            records
                .iter()
                .find(|record| record.id == id)
                .and_then(|record| record.handle.clone())
                .with_context(|| format!("{id} has no worker"))?
        };
        handle.shutdown(Duration::from_secs(5)).await
    }

    /// Ordered pairs of nodes holding an endpoint that cannot reach each
    /// other over the fabric.
    pub async fn missing_links(&self) -> Vec<(NodeId, NodeId)> {
        let registry = self.cluster.registry();
        let records = registry.read().await;
        let live: Vec<(NodeId, Address)> = records
            .iter()
            .filter_map(|record| Some((record.id, record.address.clone()?)))
            .collect();
        let mut missing = Vec::new();
        for (a, from) in &live {
            for (b, to) in &live {
                if a != b && !registry.fabric().is_connected(from, to) {
                    missing.push((*a, *b));
                }
            }
        }
        missing
    }

    /// Links pointing at an address that no record owns anymore.
    pub async fn dangling_links(&self) -> Vec<Address> {
        let registry = self.cluster.registry();
        let records = registry.read().await;
        let owned: HashSet<Address> = records
            .iter()
            .filter_map(|record| record.address.clone())
            .collect();
        owned
            .iter()
            .flat_map(|address| registry.fabric().links_from(address))
            .filter(|target| !owned.contains(target))
            .collect()
    }

    pub async fn shutdown(self) {
        self.cluster.shutdown_all().await;
    }
}

/// Polls `check` every 20ms until it yields `Some`, or fails after `timeout`.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
