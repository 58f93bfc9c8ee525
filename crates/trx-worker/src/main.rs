//! Worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trx_media::{check_ffmpeg, FfmpegExecutor};
use trx_models::NextSubtaskRequest;
use trx_worker::{
    cleanup, metrics, AdmissionScheduler, CodecCostTable, ComposerClient, SubtaskExecutor, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Required for rustls 0.23+
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    init_tracing()?;

    info!("Starting trx-worker");

    let config = Arc::new(WorkerConfig::from_env());
    info!(
        composer = %config.composer_url,
        hostname = %config.hostname,
        routing = %config.routing,
        cpu_quota = config.cpu_quota,
        max_tasks_per_slot = config.max_tasks_per_slot,
        "Worker config loaded"
    );

    let ffmpeg = check_ffmpeg().context("ffmpeg is required")?;
    info!(path = %ffmpeg.display(), "Found ffmpeg");

    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr).context("installing metrics exporter")?;
        info!(%addr, "Prometheus metrics enabled");
    }

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    let client = ComposerClient::new(
        config.composer_url.clone(),
        NextSubtaskRequest {
            hostname: config.hostname.clone(),
            worker_id: config.worker_id.clone(),
            routing: config.routing.clone(),
        },
    )?;

    let reset = cleanup::reset_tasks(&config.work_dir, &client)
        .await
        .context("resetting leftover tasks")?;
    if !reset.is_empty() {
        warn!(count = reset.len(), "Reset tasks interrupted by a previous run");
    }

    let scheduler = Arc::new(AdmissionScheduler::new(
        config.cpu_quota,
        config.max_tasks_per_slot,
        Arc::new(CodecCostTable::new(config.codec_weights.clone())),
    ));
    let transcoder = Arc::new(FfmpegExecutor {
        timeout_secs: config.encode_timeout.map(|d| d.as_secs()),
    });
    let executor = Arc::new(SubtaskExecutor::new(
        Arc::clone(&config),
        client,
        scheduler,
        transcoder,
    ));

    let (janitor_tx, janitor_rx) = watch::channel(false);
    let janitor = {
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            cleanup::run_janitor(&config.work_dir, config.cleanup_interval, config.cleanup_max_age, janitor_rx).await
        })
    };

    let run = tokio::spawn(Arc::clone(&executor).run());

    shutdown_signal().await;
    executor.shutdown();
    let _ = janitor_tx.send(true);

    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Executor stopped with error"),
        Err(e) => warn!(error = %e, "Executor task ended abnormally"),
    }
    if let Err(e) = janitor.await {
        warn!(error = %e, "Janitor ended abnormally");
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
