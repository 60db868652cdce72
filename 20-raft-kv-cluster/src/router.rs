//! Leader-aware command routing.
//!
//! Writes go through the leader's consensus handle and succeed only once the
//! entry is applied on the leader. Reads are served straight from the
//! leader's state machine: they see everything the leader has applied,
//! which can be ahead of what some followers hold, but never a write that
//! was not committed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::command::Command;
use crate::error::ClusterError;
use crate::registry::ClusterRegistry;
use crate::runtime::role_name;
use crate::topology::NodeId;

/// Result of a routed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The write was committed and applied on the leader.
    Written { key: String },
    /// The leader's current value for `key`.
    Value { key: String, value: String },
}

/// Which node leads right now, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderStatus {
    pub leader: NodeId,
    pub state: &'static str,
}

/// Sends client commands to whichever node leads at call time.
///
/// The leader is resolved afresh for every command, so a leader change
/// between two calls is picked up without any retry logic here.
#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<ClusterRegistry>,
    apply_timeout: Duration,
}

impl CommandRouter {
    pub fn new(registry: Arc<ClusterRegistry>, apply_timeout: Duration) -> Self {
        Self {
            registry,
            apply_timeout,
        }
    }

    /// Executes one command against the current leader.
    ///
    /// `set` resolves once the entry is applied on the leader, bounded by the
    /// apply timeout; a timeout or lost leadership surfaces as
    /// [`ClusterError::WriteFailed`]. `get` reads the leader's state machine
    /// and fails with [`ClusterError::KeyNotFound`] for absent keys. Without
    /// a running leader both fail with [`ClusterError::NoLeader`].
    pub async fn handle(&self, command: Command) -> Result<CommandOutcome, ClusterError> {
        let leader = self
            .registry
            .current_leader()
            .await
            .ok_or(ClusterError::NoLeader)?;

        match command {
            Command::Set { key, value } => {
                let data = Command::Set {
                    key: key.clone(),
                    value,
                }
                .encode()?;
                let index = leader
                    .handle
                    .apply(data, self.apply_timeout)
                    .await
                    .map_err(|err| ClusterError::WriteFailed(format!("{err:#}")))?;
                debug!(leader = %leader.id, index, key = %key, "write committed");
                Ok(CommandOutcome::Written { key })
            }
            Command::Get { key } => match leader.store.get(&key) {
                Some(value) => Ok(CommandOutcome::Value { key, value }),
                None => Err(ClusterError::KeyNotFound(key)),
            },
        }
    }

    /// Reports the current leader and its role name.
    pub async fn leader_status(&self) -> Result<LeaderStatus, ClusterError> {
        let leader = self
            .registry
            .current_leader()
            .await
            .ok_or(ClusterError::NoLeader)?;
        Ok(LeaderStatus {
            leader: leader.id,
            state: role_name(leader.role),
        })
    }
}
