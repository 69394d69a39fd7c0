//! Parley signalling relay binary.

use parley_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    parley_logging::init("parley_relay=info,tower_http=info");

    let config = RelayConfig::from_env()?;
    tracing::info!("Starting Parley relay");
    tracing::info!("  Listen: {}", config.listen_addr);
    tracing::info!("  Max room size: {}", config.max_room_size);

    let server = RelayServer::new(config);
    server.run(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
