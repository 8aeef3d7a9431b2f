//! archipeld — Archipel peer-to-peer daemon.
//!
//! Starts one node from the resolved configuration, optionally shares
//! the files named on the command line, and runs until interrupted.

use std::path::Path;

use anyhow::{Context, Result};

use archipel_core::config::ArchipelConfig;
use archipeld::Node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ArchipelConfig::load().context("failed to load configuration")?;
    let node = Node::start(config).await.context("failed to start node")?;

    for arg in std::env::args().skip(1) {
        match node.share_file(Path::new(&arg)) {
            Ok(manifest) => tracing::info!(
                file = %manifest.file_name,
                file_id = %&manifest.file_id[..16],
                "sharing"
            ),
            Err(e) => tracing::warn!(path = %arg, error = %e, "could not share file"),
        }
    }

    tracing::info!(
        node_id = %node.node_id(),
        port = node.tcp_port(),
        "archipeld running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("signal wait")?;
    node.stop().await;
    Ok(())
}
