use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::ClusterConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the in-process cluster behind an HTTP API.
    Serve(ServeArgs),
    /// Interactive shell against a running server.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the HTTP API binds to.
    #[arg(long, env = "RAFT_KV_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Number of logical nodes.
    #[arg(long, env = "RAFT_KV_NODES", default_value_t = 5)]
    pub nodes: usize,

    /// Stops are refused once only this many nodes are running.
    #[arg(long, env = "RAFT_KV_MIN_RUNNING", default_value_t = 3)]
    pub min_running: usize,

    /// Raft tick interval in milliseconds.
    #[arg(long, env = "RAFT_KV_TICK_MS", default_value_t = 100)]
    pub tick_ms: u64,

    #[arg(long, env = "RAFT_KV_ELECTION_TICK", default_value_t = 10)]
    pub election_tick: usize,

    #[arg(long, env = "RAFT_KV_HEARTBEAT_TICK", default_value_t = 3)]
    pub heartbeat_tick: usize,

    /// Bound on replicating one write, in milliseconds.
    #[arg(long, env = "RAFT_KV_APPLY_TIMEOUT_MS", default_value_t = 5000)]
    pub apply_timeout_ms: u64,

    #[arg(long, env = "RAFT_KV_ADD_VOTER_TIMEOUT_MS", default_value_t = 5000)]
    pub add_voter_timeout_ms: u64,

    #[arg(long, env = "RAFT_KV_SHUTDOWN_TIMEOUT_MS", default_value_t = 5000)]
    pub shutdown_timeout_ms: u64,

    #[arg(long, env = "RAFT_KV_SNAPSHOT_TIMEOUT_MS", default_value_t = 5000)]
    pub snapshot_timeout_ms: u64,

    /// How long startup waits for the first leader, in milliseconds.
    #[arg(long, env = "RAFT_KV_BOOTSTRAP_TIMEOUT_MS", default_value_t = 10000)]
    pub bootstrap_timeout_ms: u64,

    /// Snapshot root; wiped on startup.
    #[arg(long, env = "RAFT_KV_SNAPSHOT_DIR", default_value = "snapshots")]
    pub snapshot_dir: PathBuf,

    #[arg(long, env = "RAFT_KV_RETAIN_SNAPSHOTS", default_value_t = 2)]
    pub retain_snapshots: usize,
}

impl ServeArgs {
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            nodes: self.nodes,
            min_running: self.min_running,
            tick_interval: Duration::from_millis(self.tick_ms),
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            add_voter_timeout: Duration::from_millis(self.add_voter_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            snapshot_timeout: Duration::from_millis(self.snapshot_timeout_ms),
            bootstrap_timeout: Duration::from_millis(self.bootstrap_timeout_ms),
            snapshot_dir: self.snapshot_dir.clone(),
            retain_snapshots: self.retain_snapshots,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Base URL of the server.
    #[arg(long, env = "RAFT_KV_SERVER", default_value = "http://127.0.0.1:8080")]
    pub server: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_reference_config() {
        let cli = Cli::try_parse_from(["raft-kv", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.cluster_config();
        let reference = ClusterConfig::default();
        assert_eq!(config.nodes, reference.nodes);
        assert_eq!(config.min_running, reference.min_running);
        assert_eq!(config.tick_interval, reference.tick_interval);
        assert_eq!(config.apply_timeout, reference.apply_timeout);
        assert_eq!(config.snapshot_dir, reference.snapshot_dir);
    }

    #[test]
    fn serve_flags_override_topology() {
        let cli = Cli::try_parse_from([
            "raft-kv",
            "serve",
            "--nodes",
            "7",
            "--min-running",
            "4",
            "--tick-ms",
            "20",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.cluster_config();
        config.validate().unwrap();
        assert_eq!(config.topology().unwrap().len(), 7);
        assert_eq!(config.tick_interval, Duration::from_millis(20));
    }

    #[test]
    fn client_takes_server_url() {
        let cli = Cli::try_parse_from(["raft-kv", "client", "--server", "http://10.0.0.1:9000"])
            .unwrap();
        let Command::Client(args) = cli.command else {
            panic!("expected client");
        };
        assert_eq!(args.server, "http://10.0.0.1:9000");
    }
}
