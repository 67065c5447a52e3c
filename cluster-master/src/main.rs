use clap::Parser;
use cluster_core::InMemoryRegistry;
use cluster_master::{
    Args, ClusterStatusHandler, ClusterView, MasterLifecycle, MembershipWatcher, ShutdownManager,
    ShutdownReason,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            received = signal::ctrl_c() => {
                received?;
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // No external registry client ships with the master, so workers are
    // registered in an embedded one.
    let registry = InMemoryRegistry::new();
    for worker in &config.seed_workers {
        registry.register(&config.watcher.path, worker);
    }

    let watcher = MembershipWatcher::new(registry, config.watcher.clone());
    let view = ClusterView::new();
    let _view_updates = view.follow(watcher.subscribe());

    let mut lifecycle = MasterLifecycle::new(
        config.endpoint.clone(),
        watcher,
        config.acceptor.clone(),
        config.pipeline.clone(),
        ClusterStatusHandler::new(view),
    );

    let shutdown = ShutdownManager::new();
    let trigger = shutdown.shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                trigger.trigger(ShutdownReason::Signal).await;
            }
            Err(error) => error!(%error, "Failed to install signal handlers"),
        }
    });

    info!(
        listen = %config.endpoint.listen_addr(),
        registry = %config.endpoint.registry_address,
        "Starting master"
    );

    match lifecycle.run(shutdown, config.grace_period).await {
        Ok(reason) => {
            info!(?reason, "Master exited");
            Ok(())
        }
        Err(error) => {
            error!(%error, "Master failed to start");
            Err(error.into())
        }
    }
}
