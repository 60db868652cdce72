//! In-memory key-value state machine fed by committed Raft entries.
//!
//! Each node owns one [`KvStateMachine`]. The Raft worker applies committed
//! `set` commands to it; the router reads from the leader's instance directly.
//! Nothing else mutates it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::ClusterError;
use crate::topology::NodeId;

/// Point-in-time copy of a state machine, as written to the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub store: BTreeMap<String, String>,
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
}

impl StateSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

struct Inner {
    data: BTreeMap<String, String>,
    node_id: NodeId,
}

/// Replicated state machine for one node.
///
/// The map and the owning node id sit behind one mutex so a restore swaps
/// both at once and a snapshot never observes a half-applied entry.
pub struct KvStateMachine {
    inner: Mutex<Inner>,
}

impl KvStateMachine {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                node_id,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> NodeId {
        self.lock().node_id
    }

    /// Applies a committed command. Returns `true` if the map changed.
    ///
    /// `get` never reaches the log, but if one does it is ignored.
    pub fn apply(&self, command: &Command) -> bool {
        match command {
            Command::Set { key, value } => {
                self.lock().data.insert(key.clone(), value.clone());
                true
            }
            Command::Get { .. } => false,
        }
    }

    /// Decodes a raw log entry and applies it.
    pub fn apply_entry(&self, data: &[u8]) -> Result<Command, ClusterError> {
        let command = Command::decode(data)?;
        self.apply(&command);
        Ok(command)
    }

    /// Local read of whatever this node has applied so far.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            store: inner.data.clone(),
            node_id: inner.node_id,
        }
    }

    /// Replaces the whole state from an encoded [`StateSnapshot`].
    ///
    /// The payload is decoded before the lock is taken; on a decode error the
    /// current state is left untouched.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), ClusterError> {
        let snapshot = StateSnapshot::decode(bytes)?;
        let mut inner = self.lock();
        inner.data = snapshot.store;
        inner.node_id = snapshot.node_id;
        Ok(())
    }
}
