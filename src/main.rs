use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lowkey_stream::catalog;
use lowkey_stream::config::{Args, Config, ExtensionSets};
use lowkey_stream::convert::{enqueue_candidates, ConversionQueue, ConversionWorker};
use lowkey_stream::publish::{run_publisher, Publisher};
use lowkey_stream::state::AppState;
use lowkey_stream::tunnel::{status_channel, TunnelSupervisor};
use lowkey_stream::watcher::ChangeWatcher;
use lowkey_stream::web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args)?);
    let extensions = Arc::new(ExtensionSets::from_config(&config));

    info!("Starting lowKey-Stream server");
    info!("Media directory: {}", config.media_dir.display());

    // The initial scan is fatal on failure; after startup, scan errors only
    // keep the previous catalog in place.
    let initial = catalog::scan(&config.media_dir, &extensions)
        .await
        .context("Failed to scan media library")?;
    info!(
        "Found {} videos ({} playable)",
        initial.videos.len(),
        initial.playable_count()
    );

    let (tunnel_tx, tunnel_rx) = status_channel();
    let state = AppState::new(
        config.clone(),
        extensions.clone(),
        initial,
        tunnel_rx.clone(),
    );

    let cancel = CancellationToken::new();

    // Conversion pipeline.
    let (queue, job_rx) = ConversionQueue::new();
    {
        let catalog = state.catalog().await;
        let queued = enqueue_candidates(&queue, &catalog, &config, &extensions);
        if queued > 0 {
            info!("Queued {queued} videos for conversion");
        }
    }
    let worker = ConversionWorker::new(state.clone(), queue.clone(), job_rx, cancel.clone());
    let worker_handle = tokio::spawn(worker.run());

    // Tunnel supervisor.
    let supervisor = TunnelSupervisor::new(config.clone(), tunnel_tx, cancel.clone())?;
    let tunnel_handle = tokio::spawn(supervisor.run());

    // Remote config publisher, fed by tunnel transitions and catalog changes.
    let (catalog_changed_tx, catalog_changed_rx) = mpsc::channel(1);
    let publisher = Publisher::new(config.publish.clone())?;
    let publisher_handle = tokio::spawn(run_publisher(
        publisher,
        state.clone(),
        tunnel_rx,
        catalog_changed_rx,
        cancel.clone(),
    ));

    // Rescan loop, nudged by the filesystem watcher and a periodic timer.
    let (rescan_tx, rescan_rx) = mpsc::channel(1);
    let watcher = match ChangeWatcher::start(&config.media_dir, extensions.clone(), rescan_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("File watcher unavailable, relying on periodic rescan: {e:#}");
            None
        }
    };
    let rescan_handle = tokio::spawn(run_rescan_loop(
        state.clone(),
        queue,
        rescan_rx,
        catalog_changed_tx,
        cancel.clone(),
    ));

    // HTTP server.
    let app = web::create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    let server_cancel = cancel.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => info!("Shutdown signal received"),
                _ = server_cancel.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    drop(watcher);
    for handle in [worker_handle, tunnel_handle, publisher_handle, rescan_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }
    info!("Shutdown complete");

    Ok(())
}

/// Rebuild the catalog on a timer and whenever the watcher fires, swap it in
/// atomically, and fan out the consequences: new conversion candidates are
/// queued and the publisher is poked when the set of videos changed.
async fn run_rescan_loop(
    state: AppState,
    queue: ConversionQueue,
    mut trigger_rx: mpsc::Receiver<()>,
    catalog_changed_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(state.config.rescan_interval_secs);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the startup scan already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            trigger = trigger_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }

        let new_catalog = match catalog::scan(&state.config.media_dir, &state.extensions).await {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("Rescan failed, keeping previous catalog: {e}");
                continue;
            }
        };

        // Changes that arrived while scanning are already reflected in the
        // result; drop any queued trigger so they do not force another pass.
        while trigger_rx.try_recv().is_ok() {}

        let previous = state.catalog().await;
        let changed = previous.paths() != new_catalog.paths();

        enqueue_candidates(&queue, &new_catalog, &state.config, &state.extensions);
        state.install_catalog(new_catalog).await;

        if changed {
            info!("Catalog updated");
            let _ = catalog_changed_tx.try_send(());
        }
    }

    info!("Rescan loop stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
