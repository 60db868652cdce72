//! Cluster configuration.
//!
//! [`ClusterConfig::default`] is the reference deployment: five nodes, at
//! least three running, 100ms Raft ticks and five second bounds on every
//! consensus call.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::node::RaftTiming;
use crate::topology::ReplicaTopology;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of logical nodes, ids `node1..=nodeN`.
    pub nodes: usize,
    /// Stops are refused once this many nodes are left running.
    pub min_running: usize,
    /// Raft logical clock interval.
    pub tick_interval: Duration,
    /// Ticks without leader contact before a follower campaigns.
    pub election_tick: usize,
    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,
    pub apply_timeout: Duration,
    pub add_voter_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub snapshot_timeout: Duration,
    /// How long startup waits for the first leader.
    pub bootstrap_timeout: Duration,
    pub snapshot_dir: PathBuf,
    pub retain_snapshots: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            min_running: 3,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            apply_timeout: Duration::from_secs(5),
            add_voter_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(10),
            snapshot_dir: PathBuf::from("snapshots"),
            retain_snapshots: 2,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        ReplicaTopology::sequential(self.nodes, self.min_running)?;
        ensure!(!self.tick_interval.is_zero(), "tick interval must be non-zero");
        ensure!(
            self.heartbeat_tick > 0 && self.election_tick > self.heartbeat_tick,
            "election tick ({}) must exceed heartbeat tick ({})",
            self.election_tick,
            self.heartbeat_tick
        );
        for (name, timeout) in [
            ("apply", self.apply_timeout),
            ("add-voter", self.add_voter_timeout),
            ("shutdown", self.shutdown_timeout),
            ("snapshot", self.snapshot_timeout),
            ("bootstrap", self.bootstrap_timeout),
        ] {
            ensure!(!timeout.is_zero(), "{name} timeout must be non-zero");
        }
        ensure!(self.retain_snapshots > 0, "must retain at least one snapshot");
        Ok(())
    }

    pub fn topology(&self) -> Result<ReplicaTopology> {
        ReplicaTopology::sequential(self.nodes, self.min_running)
    }

    pub fn raft_timing(&self) -> RaftTiming {
        RaftTiming {
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_reference_deployment() {
        let config = ClusterConfig::default();
        config.validate().unwrap();
        let topology = config.topology().unwrap();
        assert_eq!(topology.len(), 5);
        assert_eq!(topology.min_running(), 3);
        assert_eq!(config.apply_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_floor_below_majority() {
        let config = ClusterConfig {
            min_running: 2,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_timings() {
        let config = ClusterConfig {
            election_tick: 3,
            heartbeat_tick: 3,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClusterConfig {
            apply_timeout: Duration::ZERO,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
