//! tessera-daemon: hosts the key lifecycle manager, the ratchet session
//! arena and the sealed ledger in one process.
//!
//! Configuration comes from `config.toml` in the data directory. The
//! master-key passphrase is read from `TESSERA_PASSPHRASE`; without it the
//! daemon runs on the device-local fallback key.

mod config;
mod device;
mod node;

use std::sync::Arc;

use tessera_crypto::argon2id::MASTER_KEY_PARAMS;
use tessera_keys::RotationScheduler;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use crate::config::{DaemonConfig, PASSPHRASE_ENV};
use crate::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // 2. Initialize tracing; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(data_dir = %config.data_dir().display(), "Tessera daemon starting");

    // 3. Open node state
    let passphrase = std::env::var(PASSPHRASE_ENV).ok().map(Zeroizing::new);
    let node = Arc::new(Node::open(
        &config,
        passphrase.as_ref().map(|p| p.as_bytes()),
        MASTER_KEY_PARAMS,
    )?);
    drop(passphrase);
    if !node.keys().master_key().is_user_provisioned() {
        warn!("Running on the local fallback master key; set {PASSPHRASE_ENV} to provision one");
    }

    // 4. Background tasks
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let scheduler = RotationScheduler::spawn(node.keys().clone(), config.check_interval());
    let watcher = tokio::spawn(node::watch_rotations(
        node.clone(),
        shutdown_tx.subscribe(),
    ));

    info!("Tessera daemon ready");

    // 5. Wait for shutdown signal
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received");
        }
    }

    // 6. Graceful shutdown
    let _ = shutdown_tx.send(());
    if let Err(e) = watcher.await {
        error!("Rotation watcher ended abnormally: {e}");
    }
    scheduler.shutdown().await;

    info!("Tessera daemon stopped");
    Ok(())
}
