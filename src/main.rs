//! keyplane node entry point.

use clap::Parser;
use keyplane::config::KeyplaneConfig;
use keyplane::types::NodeId;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keyplane", about = "Coordination core for a sharded, replicated key-value store")]
struct Cli {
    /// Path to a JSON configuration file. CLI flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's id within the metadata cluster.
    #[arg(long)]
    node_id: Option<NodeId>,

    /// Raft RPC bind address.
    #[arg(long)]
    raft_addr: Option<String>,

    /// Coordination API bind address.
    #[arg(long)]
    api_addr: Option<String>,

    /// Known peers as `id=host:port`, comma separated.
    #[arg(long)]
    peers: Option<String>,

    /// Bootstrap a fresh single-voter cluster.
    #[arg(long)]
    bootstrap: bool,

    /// Data directory for the consensus log and snapshots.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn parse_peers(input: &str) -> anyhow::Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::new();
    for part in input.split(',').filter(|p| !p.trim().is_empty()) {
        let (id, addr) = part
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("peer '{}' is not of the form id=host:port", part))?;
        peers.insert(id.trim().parse::<NodeId>()?, addr.trim().to_string());
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => KeyplaneConfig::from_file(path)?,
        None => KeyplaneConfig::development(),
    };

    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
        config.node.name = format!("node-{}", node_id);
    }
    if let Some(raft_addr) = &cli.raft_addr {
        config.raft.bind_addr = raft_addr.parse()?;
    }
    if let Some(api_addr) = &cli.api_addr {
        config.api.bind_addr = api_addr.parse()?;
    }
    if let Some(peers) = &cli.peers {
        config.raft.peers = parse_peers(peers)?;
    }
    if cli.bootstrap {
        config.raft.bootstrap = true;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    keyplane::server::run(config).await?;
    Ok(())
}
