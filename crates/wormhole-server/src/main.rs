mod config;
mod error;
mod rendezvous;
mod transit;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wormhole_store::Store;

use crate::config::{ServeMode, ServerConfig};
use crate::rendezvous::{spawn_cleaning, RendezvousService};
use crate::transit::Matcher;

/// How long in-flight work gets to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wormhole_server=debug")),
        )
        .init();

    info!(
        "Starting wormhole server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::from_env();
    config.verify()?;
    info!(?config, "Loaded configuration");

    let store = Arc::new(Store::open_at(&config.db_file)?);
    let service = Arc::new(RendezvousService::new(store.clone(), &config));

    if config.mode == ServeMode::Clean {
        info!("Running one cleaning pass");
        service.clean_now()?;
        info!("Cleaning complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    if config.mode.runs_rendezvous() {
        let listener = TcpListener::bind(config.relay_addr()).await?;
        let rendezvous_service = service.clone();
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = rendezvous::ws::serve(listener, rendezvous_service, shutdown).await {
                error!(error = %e, "rendezvous server failed");
            }
        }));

        workers.push(spawn_cleaning(
            service.clone(),
            config.cleaning_interval_minutes,
            shutdown_rx.clone(),
        ));
    }

    if config.mode.runs_transit() {
        let listener = TcpListener::bind(config.transit_addr()).await?;
        let matcher = Arc::new(Matcher::new());
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = transit::serve(listener, matcher, shutdown).await {
                error!(error = %e, "transit server failed");
            }
        }));
    }

    wait_for_signal().await;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("shutdown grace period expired, exiting anyway");
    }

    info!("Closing database connection");
    drop(service);
    drop(store);

    info!("Completed shutdown");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Closing due to interrupt"),
        _ = term.recv() => info!("Closing due to termination signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Closing due to interrupt");
}
