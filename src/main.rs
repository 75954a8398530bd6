//! # Discovery Gateway - Main Entry Point
//!
//! Startup sequence:
//!
//! 1. Parse settings (flags with `GATEWAY_*` environment fallbacks) and initialise logging
//! 2. Load the routing config once; an unreadable or malformed file is fatal here
//! 3. Start the config watcher and its reconciler
//! 4. Optionally connect to Kubernetes and start the service and pod watchers
//! 5. Serve HTTP until SIGINT or SIGTERM, then cancel the shared token and join every task
//!
//! Any failure before the server is listening exits with status 1. After that, update
//! pipeline failures are logged and the last known routes keep serving.

use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use discovery_gateway::discovery::{ClusterReconciler, ConfigReconciler, ConfigSource, KubernetesWatcher};
use discovery_gateway::observability::{init_logging, install_prometheus_exporter};
use discovery_gateway::{GatewayServer, GatewaySettings, Router, ServerConfig, ServiceRegistry};

/// Buffered cluster events between the watchers and the reconciler
const CLUSTER_EVENT_CAPACITY: usize = 1024;

/// How long in-flight requests and background tasks get to finish after a signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let settings = GatewaySettings::parse();

    if let Err(e) = init_logging(&settings.log_level, settings.log_format) {
        eprintln!("Failed to initialise logging: {}", e);
        std::process::exit(1);
    }

    info!("🚀 Starting Discovery Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(settings).await {
        error!("Gateway failed: {:#}", e);
        std::process::exit(1);
    }

    info!("✅ Discovery Gateway shutdown complete");
}

async fn run(settings: GatewaySettings) -> anyhow::Result<()> {
    settings.validate().context("invalid settings")?;

    if let Some(addr) = settings.metrics_addr {
        install_prometheus_exporter(addr)?;
    }

    let shutdown = CancellationToken::new();
    let registry = Arc::new(ServiceRegistry::new());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Routing config: first load is fatal, later failures keep the last good routes
    let source = ConfigSource::new(&settings.config_path, settings.reload_mode());
    let initial = source.load().await.with_context(|| {
        format!("failed to load routing config from {}", settings.config_path.display())
    })?;

    let mut config_reconciler = ConfigReconciler::new(Arc::clone(&registry));
    config_reconciler.apply(initial);

    let watch = source.watch(shutdown.clone())?;
    tasks.push(watch.task);
    tasks.push(tokio::spawn(config_reconciler.run(watch.updates, shutdown.clone())));

    if settings.kubernetes.enabled {
        let watcher = KubernetesWatcher::connect(&settings.kubernetes)
            .await
            .context("failed to create Kubernetes client")?;
        let (events_tx, events_rx) = mpsc::channel(CLUSTER_EVENT_CAPACITY);
        let cluster_reconciler = ClusterReconciler::from_settings(Arc::clone(&registry), &settings.kubernetes);

        tasks.extend(watcher.spawn(events_tx, shutdown.clone()));
        tasks.push(tokio::spawn(cluster_reconciler.run(events_rx, shutdown.clone())));
    } else {
        info!("Kubernetes discovery disabled");
    }

    let router = Router::new(Arc::clone(&registry), shutdown.clone());
    let server = GatewayServer::new(router, ServerConfig::from(&settings))?;
    let listener = TcpListener::bind(server.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", server.bind_addr()))?;

    let mut server_task = tokio::spawn(server.serve_with_listener(listener, shutdown.clone()));

    let finished_early = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut server_task => Some(joined),
    };

    info!("🛑 Beginning graceful shutdown");
    shutdown.cancel();

    let server_outcome = match finished_early {
        Some(joined) => Some(joined),
        None => match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                warn!("Server shutdown timed out after {:?}", SHUTDOWN_GRACE);
                None
            }
        },
    };

    let joined_tasks = async {
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, joined_tasks).await.is_err() {
        warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    match server_outcome {
        Some(Ok(Ok(()))) | None => Ok(()),
        Some(Ok(Err(e))) => Err(e).context("gateway server failed"),
        Some(Err(e)) => bail!("gateway server task failed: {}", e),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}
