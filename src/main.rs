//! Glued broker daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;

use glued_broker::transport::{serve, TcpTransport};
use glued_broker::{Broker, Config, ExchangeCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting broker {} at {} with {} peers",
        cfg.node_name,
        cfg.location,
        cfg.peers.len()
    );
    for problem in cfg.validate() {
        warn!("Configuration problem: {}", problem);
    }

    // Exchange coordinator and its event loop
    let transport =
        Arc::new(TcpTransport::new(&cfg.cluster_secret).with_max_frame(cfg.max_frame_bytes));
    let mut coordinator = ExchangeCoordinator::new(cfg.local(), transport, cfg.backoff_unit());
    for peer in cfg.remote_peers() {
        coordinator.add_peer(peer.clone());
    }
    let broker = Broker::new(coordinator, cfg.health_interval());
    let handle = broker.handle();
    let broker_handle = tokio::spawn(broker.run());

    // Peer and client listener
    let listener = TcpListener::bind(cfg.listen).await?;
    let server_broker = handle.clone();
    let cluster_secret = cfg.cluster_secret.clone();
    let max_frame = cfg.max_frame_bytes;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, server_broker, cluster_secret, max_frame).await {
            error!("Listener failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    server_handle.abort();
    if handle.shutdown().await.is_ok() {
        if let Err(e) = broker_handle.await {
            error!("Broker task failed: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
