//! Raft-replicated key-value store with runtime node stop/start.
//!
//! A fixed pool of logical nodes runs inside one process. Each node is a
//! tikv/raft `RawNode` driven by its own worker thread, exchanging messages
//! over an in-process [`fabric`]. On top of that:
//!
//! - the [`router`] sends writes through the current leader and serves reads
//!   from the leader's state machine
//! - the [`controller`] stops and re-admits nodes without ever dropping the
//!   number of running nodes below the configured floor
//! - the [`server`] exposes both over HTTP, and [`client`] is a small REPL
//!   against it
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the Raft log
//! - [`store`]: per-node state machine, snapshots and restores
//! - [`snapshot`]: on-disk snapshot files per node
//! - [`fabric`]: virtual network between node endpoints
//! - [`topology`]: node ids and quorum arithmetic
//! - [`node`]: `RawNode` wrapper
//! - [`runtime`]: worker thread and async [`runtime::ConsensusHandle`]
//! - [`registry`]: one record per node plus leader lookup
//! - [`cluster`]: bootstrap and shutdown of the whole pool

pub mod cli;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod fabric;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod topology;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::ClusterError;
