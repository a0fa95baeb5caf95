//! Bad IP service CLI.

use anyhow::{Context, Result};
use badip_service::{api, ArchiveLoader, BlocklistStore, Config, LoadOutcome, RefreshScheduler};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "badip-service")]
#[command(about = "Answer bad IP lookups from a periodically refreshed blocklist archive")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "badip.yaml")]
    config: PathBuf,

    /// Listen address, overrides server.listen
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let store = Arc::new(BlocklistStore::new(config.store.capacity));
    let loader = Arc::new(ArchiveLoader::from_config(&config)?);
    let scheduler = RefreshScheduler::new(loader, store.clone(), config.refresh.interval());

    // The service does not start without an initial list.
    if let LoadOutcome::Replaced { found, stored, .. } = scheduler
        .refresh_once()
        .await
        .context("Initial blocklist load failed")?
    {
        if found != stored {
            warn!(found, stored, "Number of found bad addresses was not equal to stored number");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let listen = args.listen.unwrap_or(config.server.listen);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let app = api::router(store, config.server.stale_after(&config.refresh));

    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(api::serve(listener, app, async move {
        // Fires on the shutdown flag or when the sender goes away.
        let _ = server_shutdown.changed().await;
    }));

    let finished_early = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    if finished_early.is_none() {
        info!("Shutdown signal received");
    }

    let _ = shutdown_tx.send(true);
    let served = match finished_early {
        Some(result) => result,
        None => server.await,
    };
    refresher.await?;
    served?.context("Lookup service failed")?;

    info!("Shutting down");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = hup.recv() => {}
                }
            }
            _ => {
                warn!("Failed to install SIGTERM/SIGHUP handlers");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
