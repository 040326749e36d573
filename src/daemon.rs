use crate::config::Config;
use anyhow::{Context, Result};
use dalyble_lib::acquisition::Acquisition;
use dalyble_lib::bluetooth::BluestTransport;
use dalyble_lib::cache::{FileMirror, SnapshotCache};
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).with_context(|| "Cannot install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.with_context(|| "Cannot listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Cannot listen for Ctrl-C")?;
    Ok(())
}

pub async fn run(config: Config) -> Result<()> {
    let cache = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create data directory {dir:?}"))?;
            info!("Mirroring snapshots to {dir:?}");
            SnapshotCache::with_mirror(FileMirror::new(dir))
        }
        None => SnapshotCache::new(),
    };
    let settings = config.settings();
    info!(
        "Starting daemon mode: target={}, interval={:?}, timeout={:?}",
        settings.target, settings.poll_interval, settings.request_timeout
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // keep the sender alive, dropping it would stop the loop
                error!("{e:#}");
                std::future::pending::<()>().await;
            }
        }
    });

    Acquisition::new(settings, Arc::new(cache), BluestTransport::new)
        .run(shutdown_rx)
        .await;
    info!("Daemon stopped");
    Ok(())
}
