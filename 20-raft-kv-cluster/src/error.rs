//! Error taxonomy for lifecycle and routing operations.
//!
//! Every variant is recovered at the controller/router boundary and turned
//! into a structured `{"error": ...}` response. Nothing here is fatal to the
//! process; startup failures use `anyhow` instead and abort `main`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::topology::NodeId;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The id does not belong to the configured topology.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {0} is already stopped")]
    AlreadyStopped(NodeId),

    #[error("node {0} is already running")]
    AlreadyRunning(NodeId),

    /// Another stop or start for this node has not finished yet.
    #[error("node {0} is in the middle of a stop or start, try again")]
    NodeBusy(NodeId),

    /// Stopping the node would leave fewer running nodes than the floor.
    #[error(
        "cannot stop {node}: {running} nodes are running and at least {floor} must stay up"
    )]
    QuorumViolation {
        node: NodeId,
        running: usize,
        floor: usize,
    },

    /// A restart needs an existing quorum to approve the membership change.
    #[error("not enough running nodes to form a quorum ({running} running, {required} required), start more nodes first")]
    InsufficientQuorum { running: usize, required: usize },

    #[error("no leader elected")]
    NoLeader,

    /// A restarted node could not find a leader to join through.
    #[error("no leader available to admit node {0}")]
    LeaderUnavailable(NodeId),

    #[error("node {node} failed to join the cluster: {reason}")]
    JoinFailed { node: NodeId, reason: String },

    #[error("failed to stop node {node}: {reason}")]
    StopFailed { node: NodeId, reason: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("key {0:?} not found")]
    KeyNotFound(String),

    /// Malformed command, lifecycle request or snapshot payload.
    #[error("malformed payload: {0}")]
    Decode(String),
}

impl ClusterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::NodeNotFound(_) | ClusterError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::AlreadyStopped(_)
            | ClusterError::AlreadyRunning(_)
            | ClusterError::QuorumViolation { .. }
            | ClusterError::Decode(_) => StatusCode::BAD_REQUEST,
            ClusterError::NodeBusy(_) => StatusCode::CONFLICT,
            ClusterError::NoLeader
            | ClusterError::LeaderUnavailable(_)
            | ClusterError::InsufficientQuorum { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::JoinFailed { .. }
            | ClusterError::StopFailed { .. }
            | ClusterError::WriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Decode(err.to_string())
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_map_to_client_statuses() {
        let node = NodeId::new(3);
        assert_eq!(
            ClusterError::NodeNotFound(node).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ClusterError::AlreadyStopped(node).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ClusterError::QuorumViolation {
                node,
                running: 3,
                floor: 3
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ClusterError::NodeBusy(node).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn availability_errors_map_to_service_unavailable() {
        assert_eq!(
            ClusterError::NoLeader.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ClusterError::InsufficientQuorum {
                running: 2,
                required: 3
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ClusterError::WriteFailed("timed out".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn quorum_violation_message_names_the_floor() {
        let err = ClusterError::QuorumViolation {
            node: NodeId::new(4),
            running: 3,
            floor: 3,
        };
        assert_eq!(
            err.to_string(),
            "cannot stop node4: 3 nodes are running and at least 3 must stay up"
        );
    }
}
