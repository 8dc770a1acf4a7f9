//! mkbridge daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use mkbridge::discovery::{Directory, Discovery, FileDiscovery};
use mkbridge::job::{DocumentStore, FtpFetcher};
use mkbridge::notify::{Event, Interest};
use mkbridge::transport::TcpTransport;
use mkbridge::{Config, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting mkbridge with config: {:?}", cfg);

    // Local jobs
    let store = match &cfg.jobs_dir {
        Some(dir) => match DocumentStore::load_dir(dir) {
            Ok(store) => {
                info!("Loaded {} job(s) from {}", store.len(), dir.display());
                store
            }
            Err(e) => {
                warn!("Cannot read jobs from {}: {}", dir.display(), e);
                DocumentStore::new()
            }
        },
        None => DocumentStore::new(),
    };

    // Update channel
    let (update_tx, update_rx) = mpsc::channel(128);

    // Discovery
    let discovery = FileDiscovery::new(cfg.discovery_file.clone(), cfg.discovery_refresh());
    let discovery_handle = tokio::spawn(async move {
        if let Err(e) = discovery.monitor(update_tx).await {
            error!("Discovery failed: {}", e);
        }
    });

    let directory = Directory::new();
    let directory_handle = tokio::spawn(directory.clone().run(update_rx));

    // Registry
    let registry = Arc::new(Registry::new(
        cfg.clone(),
        directory,
        Box::new(TcpTransport::new(cfg.connect_timeout())),
        Arc::new(FtpFetcher::new(cfg.fetch_timeout())),
        Arc::new(store),
    ));

    // Event log
    let mut subscription = registry.subscribe(Interest::all());
    let events_handle = tokio::spawn(async move {
        while let Some(event) = subscription.events.recv().await {
            match event {
                Event::TopicChanged { .. } => {}
                Event::JobOutOfDate {
                    instance,
                    title,
                    file_name,
                } => warn!("{}: job {}.{} is out of date", instance, file_name, title),
                Event::ToolChangeRequested { instance, tool } => {
                    warn!("{}: insert tool #{} and confirm", instance, tool)
                }
                other => info!("{:?}", other),
            }
        }
    });

    let registry_for_loop = Arc::clone(&registry);
    let registry_handle = tokio::spawn(async move { registry_for_loop.run().await });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    registry.shutdown().await;
    if let Err(e) = registry_handle.await {
        error!("Registry loop failed: {}", e);
    }

    // Abort tasks
    discovery_handle.abort();
    directory_handle.abort();
    events_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
