//! Composer binary.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trx_composer::{create_router, metrics, ComposerConfig, ComposerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Required for rustls 0.23+
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    init_tracing()?;

    info!("Starting trx-composer");

    let config = ComposerConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        hostname = %config.hostname,
        public_addr = %config.public_addr,
        "Composer config loaded"
    );

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("creating output dir {}", config.output_dir.display()))?;

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("installing metrics recorder")?)
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    let service = ComposerService::connect(config).await.context("connecting stores")?;
    let app = create_router(service.state(), metrics_handle);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = service.spawn_background(shutdown_rx);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining phases");
    let _ = shutdown_tx.send(true);
    while let Some(result) = background.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("trx=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
    info!("Received shutdown signal");
}
