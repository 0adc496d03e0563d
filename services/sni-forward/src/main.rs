//! SNI forwarder
//!
//! Blind TLS forwarding proxy.
//!
//! This service:
//! - Loads route definitions from a JSON file (generating a default if absent)
//! - Accepts TCP connections on every configured route
//! - Reads the TLS ClientHello to learn the requested server name
//! - Connects to the allowed upstream and relays bytes without decrypting

use std::io;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_forward::{Config, ForwarderConfig, Listener, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Initialize tracing (prefer RUST_LOG, fallback to SNI_FORWARD_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting SNI forwarder");

    let routes = ForwarderConfig::load_or_init(&config.config_path)
        .with_context(|| format!("loading routes from {}", config.config_path.display()))?;
    let policies = routes.policies()?;

    info!(
        path = %config.config_path.display(),
        route_count = policies.len(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let mut handles = Vec::with_capacity(policies.len());

    for policy in policies {
        let name = policy.name.clone();
        let bind_addr = policy.listen_addr;

        match Listener::bind(policy).await {
            Ok(listener) => handles.push(listener.spawn(&shutdown)),
            Err(e) => {
                if e.kind() == io::ErrorKind::PermissionDenied && bind_addr.port() < 1024 {
                    warn!(
                        route = %name,
                        bind_addr = %bind_addr,
                        "Ports below 1024 need root or CAP_NET_BIND_SERVICE"
                    );
                }
                error!(
                    route = %name,
                    bind_addr = %bind_addr,
                    error = %e,
                    "Failed to bind listener"
                );
                shutdown.cancel();
                join_all(handles.into_iter().map(|h| h.stop())).await;
                return Err(e).with_context(|| format!("binding route {name} on {bind_addr}"));
            }
        }
    }

    info!(listener_count = handles.len(), "Forwarder running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping listeners");

    shutdown.cancel();
    join_all(handles.into_iter().map(|h| h.stop())).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
