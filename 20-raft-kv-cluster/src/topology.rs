use std::fmt;
use std::str::FromStr;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Stable identity of a logical node.
///
/// The same number is the Raft id; the text form (`node3`) is what clients
/// and operators see. Parsing also accepts the bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "NodeIdRepr", into = "String")]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raft_id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("node").unwrap_or(trimmed);
        match digits.parse::<u64>() {
            Ok(0) | Err(_) => Err(ClusterError::Decode(format!("invalid node id {s:?}"))),
            Ok(raw) => Ok(Self(raw)),
        }
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeIdRepr {
    Text(String),
    Number(u64),
}

impl TryFrom<NodeIdRepr> for NodeId {
    type Error = ClusterError;

    fn try_from(repr: NodeIdRepr) -> Result<Self, Self::Error> {
        match repr {
            NodeIdRepr::Text(text) => text.parse(),
            NodeIdRepr::Number(0) => Err(ClusterError::Decode("node id 0 is reserved".into())),
            NodeIdRepr::Number(raw) => Ok(Self(raw)),
        }
    }
}

/// Fixed set of node ids plus the running-node floor enforced on stop.
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    nodes: Vec<NodeId>,
    min_running: usize,
}

impl ReplicaTopology {
    pub fn new(nodes: Vec<NodeId>, min_running: usize) -> Result<Self> {
        ensure!(!nodes.is_empty(), "topology requires at least one node");
        let mut sorted = nodes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        ensure!(sorted.len() == nodes.len(), "node ids must be unique");
        let quorum = nodes.len() / 2 + 1;
        ensure!(
            min_running >= quorum,
            "minimum running nodes ({min_running}) must be at least a majority ({quorum})"
        );
        ensure!(
            min_running <= nodes.len(),
            "minimum running nodes ({min_running}) exceeds topology size ({})",
            nodes.len()
        );
        Ok(Self { nodes, min_running })
    }

    /// `node1..=nodeN`.
    pub fn sequential(count: usize, min_running: usize) -> Result<Self> {
        Self::new((1..=count as u64).map(NodeId::new).collect(), min_running)
    }

    #[cfg(test)]
    pub(crate) fn demo() -> Self {
        Self::sequential(5, 3).expect("valid demo topology")
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn raft_ids(&self) -> Vec<u64> {
        self.nodes.iter().map(|id| id.raft_id()).collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// The node that campaigns first at bootstrap.
    pub fn primary_id(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Majority of the full voter set.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn min_running(&self) -> usize {
        self.min_running
    }

    /// A stop is allowed only while more than the floor is running.
    pub fn can_stop(&self, running: usize) -> bool {
        running > self.min_running
    }

    /// A start needs a live quorum to approve the membership change.
    pub fn can_start(&self, running: usize) -> bool {
        running >= self.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parses_both_forms() {
        assert_eq!("node3".parse::<NodeId>().unwrap(), NodeId::new(3));
        assert_eq!("4".parse::<NodeId>().unwrap(), NodeId::new(4));
        assert_eq!(NodeId::new(2).to_string(), "node2");
        assert!("node0".parse::<NodeId>().is_err());
        assert!("nodex".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_serde_accepts_text_and_numbers() {
        let text: NodeId = serde_json::from_str(r#""node5""#).unwrap();
        let number: NodeId = serde_json::from_str("5").unwrap();
        assert_eq!(text, number);
        assert_eq!(serde_json::to_string(&text).unwrap(), r#""node5""#);
        assert!(serde_json::from_str::<NodeId>("0").is_err());
    }

    #[test]
    fn reference_topology_floor() {
        let topology = ReplicaTopology::demo();
        assert_eq!(topology.len(), 5);
        assert_eq!(topology.quorum(), 3);
        assert!(topology.can_stop(5));
        assert!(topology.can_stop(4));
        assert!(!topology.can_stop(3));
        assert!(topology.can_start(3));
        assert!(!topology.can_start(2));
        assert_eq!(topology.primary_id(), NodeId::new(1));
    }

    #[test]
    fn rejects_invalid_topologies() {
        assert!(ReplicaTopology::new(vec![], 0).is_err());
        assert!(ReplicaTopology::sequential(5, 2).is_err());
        assert!(ReplicaTopology::sequential(3, 4).is_err());
        assert!(ReplicaTopology::new(vec![NodeId::new(1), NodeId::new(1)], 1).is_err());
        assert!(ReplicaTopology::sequential(4, 3).is_ok());
    }
}
