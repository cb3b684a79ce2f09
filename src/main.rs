use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use pulsetrack::adapters::{PlatformAdapter, SignalAdapter, WhatsappAdapter};
use pulsetrack::analysis::AnalysisEngine;
use pulsetrack::config::AppConfig;
use pulsetrack::db::Database;
use pulsetrack::hub::LiveHub;
use pulsetrack::netmon::{NetworkMonitor, DEFAULT_REFERENCE_TARGET};
use pulsetrack::scheduler::TrackerService;

const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Logging is not up yet; this must still reach the operator.
            eprintln!("Invalid configuration: {err:#}");
            return ExitCode::from(2);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("pulsetrack starting up...");

    match run(config).await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Fatal: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let db = Database::new(config.db_path()).context("failed to open measurement store")?;

    let monitor = NetworkMonitor::new(db.clone(), DEFAULT_REFERENCE_TARGET);
    monitor.start().await;

    let root_cancel = CancellationToken::new();
    let (updates_tx, updates_rx) = broadcast::channel(256);
    let (analysis, analysis_task) =
        AnalysisEngine::spawn(db.clone(), updates_tx, root_cancel.child_token());

    let whatsapp =
        WhatsappAdapter::new(&config.wa_bridge_url).context("failed to set up WhatsApp adapter")?;
    let signal = SignalAdapter::new(&config.signal_api_url, &config.signal_account)
        .context("failed to set up Signal adapter")?;
    let adapters: Vec<Arc<dyn PlatformAdapter>> = vec![Arc::new(whatsapp), Arc::new(signal)];

    let service = TrackerService::new(db.clone(), monitor.clone(), analysis, adapters);
    service
        .resume_tracked()
        .await
        .context("failed to resume tracked targets")?;

    let hub = LiveHub::new(
        service.clone(),
        db.clone(),
        updates_rx,
        config.client_origin.clone(),
    );
    let mut hub_task = tokio::spawn(hub.serve(config.port, root_cancel.child_token()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut hub_task => {
            result.context("hub task panicked")??;
            bail!("live hub exited unexpectedly");
        }
    }

    root_cancel.cancel();

    let shutdown = async {
        service.stop_all().await;
        monitor.stop().await;
        let _ = hub_task.await;
        let _ = analysis_task.await;
    };
    if timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), shutdown)
        .await
        .is_err()
    {
        warn!("Shutdown grace period exceeded; exiting with tasks still live");
    }

    // Dropping the store handle drains and joins its worker thread, so any
    // in-flight write lands before the process exits.
    drop(db);

    Ok(())
}
