#![forbid(unsafe_code)]
//! HTTP API server for Coinpit

use coinpit::api::run_api_server;
use coinpit::config::load_config;
use coinpit::node::Node;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    tracing::info!(
        node_id = %config.node.node_id,
        port = config.api.port,
        difficulty = config.mining.difficulty,
        "starting coinpit-server"
    );

    let node = tokio::task::spawn_blocking(move || -> Result<Node, coinpit::error::ChainError> {
        let node = Node::open_or_create(config)?;
        let indexed = node.reindex()?;
        tracing::info!(transactions = indexed, "UTXO index rebuilt");
        Ok(node)
    })
    .await??;

    run_api_server(Arc::new(node)).await
}
