//! divvy
//!
//! Runs the three parts of the controller in one process:
//! 1. The registration API on `:8080` (`/`, `/status`, `/health`, `/metrics`).
//! 2. The dispatcher on `:8081`, balancing every request across its host's workers.
//! 3. The sync pipeline, turning divvy-class Ingress backends into registered workers.
//!
//! `Ctrl+C` or `SIGTERM` stops both servers gracefully; a second `Ctrl+C`
//! within 10s aborts the background tasks instead of waiting for them.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{Router, Server};
use clap::Parser;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::init;

use divvy::balancer::WorkerRegistry;
use divvy::config::{build_upstream_client, try_load_config, API_PORT, DISPATCH_PORT};
use divvy::controller::Controller;
use divvy::endpoint::BalancerError;
use divvy::kube_source::{self, KubeIngressSource};
use divvy::registration::RegistrationClient;
use divvy::server::{api_router, dispatch_router};
use divvy::shutdown::ShutdownManager;

/// Command-line interface for the application.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the TOML configuration file. Defaults apply when it is missing.
    #[arg(short, long, default_value = "divvy.toml")]
    config: String,

    /// Kubeconfig to use instead of in-cluster or default inference.
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Write the balancer's address onto each synced ingress.
    #[arg(long)]
    publish_status: bool,
}

/// Binds `router` on all interfaces. The returned future serves until the
/// stop flag is raised.
fn bind(
    name: &'static str,
    port: u16,
    router: Router,
    stop_rx: watch::Receiver<bool>,
) -> Result<impl std::future::Future<Output = ()>, BalancerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = Server::try_bind(&addr)
        .map_err(|e| BalancerError::ConfigError(format!("Failed to bind {}: {}", addr, e)))?
        .serve(router.into_make_service());
    info!(server = name, bind_addr = %addr, "Listening");
    Ok(async move {
        if let Err(e) = server.with_graceful_shutdown(wait_for_stop(stop_rx)).await {
            error!(server = name, "Axum server error: {}", e);
        }
    })
}

async fn wait_for_stop(mut stop_rx: watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Main entry point: initialize logging, load config, start servers and the
/// sync pipeline, and handle shutdown.
#[tokio::main]
async fn main() -> Result<(), BalancerError> {
    init();

    let args = Cli::parse();
    let mut cfg = try_load_config(&args.config)?.unwrap_or_default();
    if let Some(path) = args.kubeconfig {
        cfg.kubernetes.get_or_insert_with(Default::default).kubeconfig = Some(path);
    }
    if args.publish_status {
        cfg.controller.get_or_insert_with(Default::default).publish_status = Some(true);
    }
    let cfg = cfg.finalize()?;
    let controller_cfg = cfg.controller.unwrap_or_default();
    let dispatcher_cfg = cfg.dispatcher.unwrap_or_default();
    let kubernetes_cfg = cfg.kubernetes.unwrap_or_default();

    let registry = Arc::new(WorkerRegistry::new());
    let upstream = build_upstream_client(&dispatcher_cfg)?;

    let client = kube_source::connect(&kubernetes_cfg).await?;
    let source = Arc::new(KubeIngressSource::new(
        client,
        kubernetes_cfg.namespace.clone(),
        controller_cfg.service_name.clone().unwrap_or_default(),
        controller_cfg.service_namespace.clone().unwrap_or_default(),
    ));
    let registrar = RegistrationClient::new(
        controller_cfg.registration_url.clone().unwrap_or_default(),
        controller_cfg.registration_timeout_secs.map(Duration::from_secs),
    )?;
    let mut controller = Controller::new(source.clone(), registrar);
    if controller_cfg.publish_status == Some(true) {
        controller = controller.with_status_publisher(source);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let api_server = bind("api", API_PORT, api_router(registry.clone()), stop_rx.clone())?;
    let dispatch_server =
        bind("dispatcher", DISPATCH_PORT, dispatch_router(registry, upstream), stop_rx)?;

    let mut shutdown_manager = ShutdownManager::new();
    let controller_rx = shutdown_manager.subscribe();
    shutdown_manager.spawn_task("controller", Arc::new(controller).run(controller_rx));

    let force_shutdown_atomic = Arc::new(AtomicBool::new(false));
    let force_shutdown_clone = force_shutdown_atomic.clone();
    tokio::spawn(async move {
        let force = shutdown_signal().await;
        if force {
            force_shutdown_clone.store(true, Ordering::Relaxed);
        }
        info!(
            "Received shutdown signal, initiating {} server shutdown...",
            if force { "forced" } else { "graceful" }
        );
        let _ = stop_tx.send(true);
    });

    info!(
        registration_url = %controller_cfg.registration_url.as_deref().unwrap_or_default(),
        publish_status = controller_cfg.publish_status.unwrap_or(false),
        "Starting divvy"
    );

    tokio::join!(api_server, dispatch_server);

    if force_shutdown_atomic.load(Ordering::Relaxed) {
        info!("Forcing shutdown of background tasks.");
        shutdown_manager.abort_all();
    } else {
        info!("Gracefully shutting down background tasks.");
        if let Err(e) = shutdown_manager.graceful_shutdown(Duration::from_secs(30)).await {
            error!("Graceful shutdown failed: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Listens for shutdown signals.
/// Returns `true` if forced shutdown is required, `false` otherwise.
async fn shutdown_signal() -> bool {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received. Starting graceful shutdown. Press Ctrl+C again within 10s to force.");
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Second Ctrl+C received - forcing immediate shutdown.");
                    true
                },
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    false
                }
            }
        },
        _ = terminate => {
            info!("SIGTERM received. Starting graceful shutdown.");
            false
        },
    }
}
