use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::adapters::{Channel, PlatformAdapter, ProbeMethod};
use crate::analysis::AnalysisHandle;
use crate::db::{Database, Measurement};
use crate::netmon::NetworkMonitor;

use super::receipts::ReceiptRouter;
use super::ChannelTiming;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// How long to wait before re-checking a bridge that reported unavailable.
const AVAILABILITY_RECHECK_MS: u64 = 3000;

/// Extra backoff after a failed send, so a broken bridge is not hammered.
const SEND_FAILURE_EXTRA_BACKOFF_MS: u64 = 5000;

enum CycleEnd {
    Completed,
    Cancelled,
    SendFailed,
    StoreFailed,
}

/// One serialized probe cycle driver for a single target. At most one
/// probe is ever in flight because the whole cycle runs inside this one
/// task: send, await ack or deadline, append, back off.
pub(crate) struct ProbeLoop {
    pub(crate) target_id: String,
    pub(crate) channel: Channel,
    pub(crate) adapter: Arc<dyn PlatformAdapter>,
    pub(crate) db: Database,
    pub(crate) monitor: NetworkMonitor,
    pub(crate) analysis: AnalysisHandle,
    pub(crate) router: ReceiptRouter,
    pub(crate) probe_method: Arc<RwLock<ProbeMethod>>,
    pub(crate) timing: ChannelTiming,
    pub(crate) cancel: CancellationToken,
}

impl ProbeLoop {
    pub(crate) async fn run(self) {
        log_info!(
            "probe loop started for {} on {}",
            self.target_id,
            self.channel
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.adapter.is_available() {
                // Scheduling halts for this channel until the bridge is back.
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(Duration::from_millis(AVAILABILITY_RECHECK_MS)) => continue,
                }
            }

            let method = *self.probe_method.read().await;
            match self.run_cycle(method).await {
                CycleEnd::Completed => {
                    if self.backoff().await {
                        break;
                    }
                }
                CycleEnd::SendFailed => {
                    // Minimum backoff plus a fixed penalty keeps a broken
                    // bridge out of a tight failure loop.
                    let penalty_ms = self.timing.backoff_min_ms + SEND_FAILURE_EXTRA_BACKOFF_MS;
                    if self.pause(penalty_ms).await {
                        break;
                    }
                }
                CycleEnd::Cancelled => break,
                CycleEnd::StoreFailed => {
                    // Measurement halts for this target; analysis keeps
                    // serving whatever was already persisted.
                    log_error!(
                        "store failure; halting measurement for {}",
                        self.target_id
                    );
                    break;
                }
            }
        }

        log_info!("probe loop stopped for {}", self.target_id);
    }

    async fn run_cycle(&self, method: ProbeMethod) -> CycleEnd {
        // Control snapshot belongs to probe start, before any sending.
        let local_snapshot = self.monitor.current_rtt();

        let ticket = match self.adapter.send_probe(&self.target_id, method).await {
            Ok(ticket) => ticket,
            Err(err) => {
                // No observable side-effect happened, so there is nothing
                // to record; only the failure gets logged.
                log_warn!("probe send to {} failed: {err}", self.target_id);
                return CycleEnd::SendFailed;
            }
        };

        if self.cancel.is_cancelled() {
            // The send settled during cancellation; discard its token.
            return CycleEnd::Cancelled;
        }

        let waiter = self.router.register(&ticket.token).await;

        let receipt = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.router.deregister(&ticket.token).await;
                return CycleEnd::Cancelled;
            }
            _ = sleep(self.timing.probe_timeout) => {
                // Deadline first: record a timeout and make sure a late
                // receipt finds no waiter.
                self.router.deregister(&ticket.token).await;
                None
            }
            receipt = waiter => receipt.ok(),
        };

        let measurement = match receipt {
            Some(receipt) => {
                let rtt = receipt
                    .delivered_at_ms
                    .saturating_sub(ticket.sent_at_ms)
                    .max(0) as u64;
                Measurement {
                    id: None,
                    target_id: self.target_id.clone(),
                    channel: self.channel,
                    timestamp_ms: ticket.sent_at_ms,
                    target_rtt_ms: Some(rtt),
                    timeout: false,
                    local_network_rtt_ms: local_snapshot,
                    probe_method: method,
                }
            }
            None => Measurement {
                id: None,
                target_id: self.target_id.clone(),
                channel: self.channel,
                timestamp_ms: ticket.sent_at_ms,
                target_rtt_ms: None,
                timeout: true,
                local_network_rtt_ms: local_snapshot,
                probe_method: method,
            },
        };

        if let Err(err) = self.db.append_measurement(&measurement).await {
            log_error!(
                "failed to append measurement for {}: {err:?}",
                self.target_id
            );
            return CycleEnd::StoreFailed;
        }

        self.analysis.notify(&self.target_id, self.channel);
        CycleEnd::Completed
    }

    /// Uniformly jittered pause between cycles. Returns true if cancelled.
    async fn backoff(&self) -> bool {
        let delay_ms = rand::thread_rng()
            .gen_range(self.timing.backoff_min_ms..=self.timing.backoff_max_ms);
        self.pause(delay_ms).await
    }

    async fn pause(&self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(Duration::from_millis(delay_ms)) => false,
        }
    }
}
