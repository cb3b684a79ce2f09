use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::LocalNetworkSample;
use crate::utils::clock;

use super::MonitorInner;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const PING_INTERVAL_MS: u64 = 2000;
const PROBE_TIMEOUT_MS: u64 = 1000;

pub(crate) async fn monitor_loop(inner: Arc<MonitorInner>, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_millis(PING_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                perform_probe(&inner).await;
            }
            _ = cancel.cancelled() => {
                log_info!("network monitor loop shutting down");
                break;
            }
        }
    }
}

/// One reference probe: TCP connect under a deadline, push the outcome
/// into the rolling window, persist a control row. A failed probe is data,
/// not an error; only the store write can genuinely fail here, and that
/// failure never reaches callers.
async fn perform_probe(inner: &Arc<MonitorInner>) {
    let timestamp_ms = clock::now_ms();
    let connect_start = Instant::now();

    let rtt_ms = match timeout(
        Duration::from_millis(PROBE_TIMEOUT_MS),
        TcpStream::connect(&inner.reference_target),
    )
    .await
    {
        Ok(Ok(stream)) => {
            drop(stream);
            Some(connect_start.elapsed().as_millis() as u64)
        }
        Ok(Err(err)) => {
            log_warn!("reference probe to {} failed: {err}", inner.reference_target);
            None
        }
        Err(_) => {
            log_warn!(
                "reference probe to {} exceeded {}ms deadline",
                inner.reference_target,
                PROBE_TIMEOUT_MS
            );
            None
        }
    };

    let (variance_ms, packet_loss_rate) = {
        let mut window = match inner.window.lock() {
            Ok(window) => window,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.push(rtt_ms);
        (window.variance_ms(), window.loss_rate())
    };

    let sample = LocalNetworkSample {
        id: None,
        timestamp_ms,
        rtt_ms,
        timeout: rtt_ms.is_none(),
        variance_ms,
        packet_loss_rate,
        reference_target: inner.reference_target.clone(),
    };

    if let Err(err) = inner.db.append_local_sample(&sample).await {
        log_error!("failed to persist network sample: {err:?}");
    }
}
