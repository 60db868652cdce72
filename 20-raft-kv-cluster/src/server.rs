//! HTTP/JSON surface over the router and the lifecycle controller.
//!
//! | Method | Path       | Body                                 |
//! |--------|------------|--------------------------------------|
//! | `POST` | `/command` | `{"op":"set","key":"k","value":"v"}` |
//! | `GET`  | `/leader`  |                                      |
//! | `POST` | `/stop`    | `{"node_id":"node3"}`                |
//! | `POST` | `/start`   | `{"node_id":"node3"}`                |
//! | `GET`  | `/nodes`   |                                      |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cluster::Cluster;
use crate::command::Command;
use crate::error::ClusterError;
use crate::router::CommandOutcome;
use crate::topology::NodeId;

pub type AppState = Arc<Cluster>;

#[derive(Debug, Deserialize)]
pub struct NodeRequest {
    pub node_id: NodeId,
}

pub fn app(cluster: AppState) -> Router {
    Router::new()
        .route("/command", post(command))
        .route("/leader", get(leader))
        .route("/stop", post(stop))
        .route("/start", post(start))
        .route("/nodes", get(nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(cluster)
}

/// Serves until Ctrl-C, then stops every node.
pub async fn serve(cluster: AppState, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(address = %listener.local_addr()?, "http server listening");

    axum::serve(listener, app(Arc::clone(&cluster)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    cluster.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn decode<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ClusterError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ClusterError::Decode(rejection.body_text()))
}

async fn command(
    State(cluster): State<AppState>,
    payload: Result<Json<Command>, JsonRejection>,
) -> Result<impl IntoResponse, ClusterError> {
    let command = decode(payload)?;
    let body = match cluster.router().handle(command).await? {
        CommandOutcome::Written { .. } => json!({ "message": "set successful" }),
        CommandOutcome::Value { key, value } => json!({ "key": key, "value": value }),
    };
    Ok(Json(body))
}

async fn leader(State(cluster): State<AppState>) -> Result<impl IntoResponse, ClusterError> {
    Ok(Json(cluster.router().leader_status().await?))
}

async fn stop(
    State(cluster): State<AppState>,
    payload: Result<Json<NodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ClusterError> {
    let NodeRequest { node_id } = decode(payload)?;
    cluster.controller().stop(node_id).await?;
    Ok(Json(json!({
        "message": format!("{node_id} stopped"),
        "node_id": node_id,
    })))
}

async fn start(
    State(cluster): State<AppState>,
    payload: Result<Json<NodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ClusterError> {
    let NodeRequest { node_id } = decode(payload)?;
    cluster.controller().start(node_id).await?;
    Ok(Json(json!({
        "message": format!("{node_id} started and joined the cluster"),
        "node_id": node_id,
    })))
}

async fn nodes(State(cluster): State<AppState>) -> impl IntoResponse {
    Json(json!({ "nodes": cluster.registry().views().await }))
}
