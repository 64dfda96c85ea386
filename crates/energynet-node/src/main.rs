//! energynet-node: the EnergyNet Protocol node binary.
//!
//! Single OS process running a Tokio async runtime. Peers and transfers
//! are configured by whatever embeds this binary's library surface; the
//! binary itself just loads `config.toml`, starts the node, and serves
//! until interrupted.

use std::sync::Arc;

use energynet_node::config::FileConfig;
use energynet_node::{Node, NodeConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let file_config = FileConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(file_config.logging.directive.parse()?),
        )
        .init();

    info!("energynet-node starting");

    let node = Arc::new(Node::new(NodeConfig {
        identity: file_config.identity.to_session_parameters(),
        listen_port: Some(file_config.network.listen_port),
    }));

    node.start().await?;
    info!(port = file_config.network.listen_port, "listening");

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    node.close().await;
    info!("energynet-node stopped");
    Ok(())
}
