//! CORS Relay - Entry Point
//!
//! Starts the HTTP (and optional HTTPS) relay listeners plus the background
//! services, with graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cors_relay::config::{Config, LogConfig};
use cors_relay::relay::middleware::ClientThrottle;
use cors_relay::relay::{server, tls, RelayHandler, RelayMode, RelayServer};
use cors_relay::services::throttle_cleanup::DEFAULT_SWEEP_INTERVAL;
use cors_relay::services::{
    LagMonitor, LagMonitorHandle, ThrottleCleanupHandle, ThrottleCleanupService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting CORS relay ({})", config.server.name);

    // Shared admission state
    let lag_monitor = Arc::new(LagMonitor::from_config(&config.load_shed));
    let throttle = ClientThrottle::from_config(&config.throttle);

    // Proxy lists are validated here, before any listener binds.
    let handler = Arc::new(
        RelayHandler::from_config(&config, lag_monitor.clone(), throttle.clone())
            .context("Failed to initialise relay")?,
    );
    match handler.mode() {
        RelayMode::Direct(_) => info!(
            "Running without proxies ({} requests per {} ms)",
            config.proxy.requests_till_rate_limit,
            config.proxy.rate_limit_sleep.as_millis()
        ),
        RelayMode::Proxied(pools) => info!(
            "Loaded {} proxies, rotation strategy: {}",
            pools.len(),
            pools.strategy_name()
        ),
    }

    let tls_acceptor = match &config.server.https {
        Some(tls_config) => {
            Some(tls::load_tls_acceptor(tls_config).context("Failed to load TLS certificate")?)
        }
        None => None,
    };

    // Bind listeners
    let http_listener = server::bind(&config.http_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr()))?;
    let https_listener = match config.https_addr() {
        Some(addr) => Some(
            server::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?,
        ),
        None => None,
    };

    // Start lag monitor
    let (lag_handle, lag_shutdown) = LagMonitorHandle::new();
    let lag_task = tokio::spawn(lag_monitor.clone().run(lag_shutdown));

    // Start throttle cleanup service
    let (cleanup_handle, cleanup_shutdown) = ThrottleCleanupHandle::new();
    let cleanup_service = ThrottleCleanupService::new(throttle, DEFAULT_SWEEP_INTERVAL);
    let cleanup_task = tokio::spawn(async move {
        cleanup_service.run(cleanup_shutdown).await;
    });

    // Start servers
    let (shutdown_tx, _) = watch::channel(false);
    let relay_server = RelayServer::new(handler.clone());

    let http_server = relay_server.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_listener, None, http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let https_task = match (https_listener, tls_acceptor) {
        (Some(listener), Some(acceptor)) => {
            let https_server = relay_server.clone();
            let https_shutdown = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = https_server
                    .run(listener, Some(acceptor), https_shutdown)
                    .await
                {
                    error!("HTTPS server error: {}", e);
                }
            }))
        }
        _ => None,
    };

    info!(
        "Relay started - HTTP: {}, HTTPS: {}",
        config.http_addr(),
        config.https_addr().as_deref().unwrap_or("disabled")
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);
    lag_handle.shutdown();
    cleanup_handle.shutdown();
    if let RelayMode::Direct(limiter) = handler.mode() {
        limiter.shutdown();
    }

    // Wait for all tasks to complete
    let _ = tokio::join!(http_task, lag_task, cleanup_task);
    if let Some(task) = https_task {
        let _ = task.await;
    }

    info!("CORS relay stopped");
    Ok(())
}

/// Install the tracing subscriber; `RUST_LOG` overrides `LOG_LEVEL`
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cors_relay={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
