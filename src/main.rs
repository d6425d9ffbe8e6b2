//! NodeProbe daemon entry point.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use log::{error, info, warn};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod merge;
mod path_mtu;
mod poller;
mod registry;
mod reporter;
mod retention;
mod schedule;
mod server;
mod store;
mod transport;
mod types;

use config::{Config, ConfigSource, FileConfigSource};
use merge::MergeEngine;
use poller::Poller;
use registry::Registry;
use reporter::Reporter;
use retention::RetentionManager;
use server::{create_router, serve, AppState};
use store::SqliteStore;
use transport::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting NodeProbe with config: {:?}", cfg);

    std::fs::create_dir_all(&cfg.data_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create data directory {}: {}", cfg.data_dir.display(), e)
    })?;

    let source = FileConfigSource::new(&cfg);
    if let Err(e) = source.write_samples() {
        warn!("Failed to write sample config files: {}", e);
    }
    let identity = source.node_identity()?;
    info!(
        "Node ID: {} ({} / {})",
        identity.id, identity.fqdn, identity.ip
    );

    // Node store; nothing runs without it
    let store = Arc::new(
        SqliteStore::open(&cfg.database_path())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?,
    );

    let registry = Arc::new(Registry::new(store.clone(), identity.id.clone()));
    registry.load().await?;
    let seeded = registry.seed(&source.seed_entries()?).await;
    if seeded > 0 {
        info!("Loaded {} seed nodes", seeded);
    }

    let transport = Arc::new(HttpTransport::new(
        cfg.peer_scheme.clone(),
        cfg.peer_port,
        cfg.probe_timeout(),
    )?);
    let merger = Arc::new(MergeEngine::new(registry.clone()));
    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Listener
    if cfg.tls_files().is_some() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    let router = create_router(Arc::new(AppState {
        registry: registry.clone(),
        merger: merger.clone(),
        history: store.clone(),
        identity: identity.clone(),
        started: Instant::now(),
    }));
    {
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve(router, &cfg, cancel.clone()).await {
                error!("Listener failed: {}", e);
                cancel.cancel();
            }
        }));
    }

    // Polling
    let poller = Arc::new(Poller::new(
        registry.clone(),
        merger.clone(),
        transport.clone(),
        store.clone(),
        cfg.probe_timeout(),
    ));
    handles.push(tokio::spawn(poller.run(cfg.poll_interval(), cancel.clone())));

    // Reporting
    let reporter = Arc::new(Reporter::new(
        registry.clone(),
        transport.clone(),
        source.reporting_server()?,
        cfg.probe_timeout(),
    ));
    handles.push(tokio::spawn(reporter.run(cfg.report_interval(), cancel.clone())));

    // Retention
    let retention = Arc::new(RetentionManager::new(
        store.clone(),
        cfg.history_budget_bytes,
        cfg.retention_batch,
    ));
    handles.push(tokio::spawn(retention.run(cfg.retention_interval(), cancel.clone())));

    // Graceful Shutdown
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = cancel.cancelled() => warn!("A service stopped unexpectedly, shutting down..."),
    }
    cancel.cancel();

    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(cfg.shutdown_grace(), join_all(handles))
        .await
        .is_err()
    {
        warn!(
            "Services did not stop within {:?}, aborting",
            cfg.shutdown_grace()
        );
        for abort in aborts {
            abort.abort();
        }
    }

    store.close().await;
    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, shutting down...");
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await
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
