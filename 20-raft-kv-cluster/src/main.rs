use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use raft_kv_cluster::{
    cli::{Cli, Command},
    client,
    cluster::Cluster,
    server,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = args.cluster_config();
            info!(nodes = config.nodes, min_running = config.min_running, "bootstrapping cluster");
            let cluster = Arc::new(Cluster::bootstrap(config).await?);
            if let Err(err) = server::serve(cluster, args.listen).await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
