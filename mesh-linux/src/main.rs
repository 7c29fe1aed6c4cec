// Mesh Linux: LAN transport, message store and a stdin console around mesh-core.

mod config;
mod console;
mod discovery;
mod lan;

use std::sync::Arc;

use mesh_core::{fixed_identity, MemoryStore, MeshHandler};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let identity = cfg.identity();
    tracing::info!(
        version = VERSION,
        peer_id = %identity.peer_id,
        name = %identity.display_name,
        discovery_port = cfg.discovery_port,
        transport_port = cfg.transport_port,
        "starting mesh node"
    );
    // Held so the identity watch stays open for the node's lifetime.
    let (_identity_tx, identity_rx) = fixed_identity(identity);

    let transport = Arc::new(lan::LanTransport::new(cfg.discovery_port, cfg.transport_port));
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(MeshHandler::new(
        transport,
        store.clone(),
        store.clone(),
        identity_rx,
        cfg.mesh,
    ));
    handler.start().await;

    let incoming = tokio::spawn(console::log_incoming(store));

    let result = tokio::select! {
        r = console::run(handler.clone()) => r,
        r = shutdown_signal() => r,
    };

    handler.stop();
    incoming.abort();
    tracing::info!("mesh node stopped");
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
