//! Probe scheduler.
//!
//! `TrackerService` owns one cancellable probe-loop task per tracked
//! target. Cycles are serialized per target by construction; across
//! targets, probing is independent.

mod probe_loop;
mod receipts;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{error, info};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterError, Channel, DisplayMetadata, PlatformAdapter, ProbeMethod};
use crate::analysis::AnalysisHandle;
use crate::db::{Database, TrackedTarget};
use crate::netmon::NetworkMonitor;
use crate::utils::clock;

use probe_loop::ProbeLoop;
use receipts::ReceiptRouter;

/// Per-channel probe deadline and backoff window. Signal receipts take
/// longer to round-trip through its bridge, hence the wider deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTiming {
    pub(crate) probe_timeout: Duration,
    pub(crate) backoff_min_ms: u64,
    pub(crate) backoff_max_ms: u64,
}

impl ChannelTiming {
    pub(crate) fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Whatsapp => Self {
                probe_timeout: Duration::from_millis(10_000),
                backoff_min_ms: 2000,
                backoff_max_ms: 5000,
            },
            Channel::Signal => Self {
                probe_timeout: Duration::from_millis(15_000),
                backoff_min_ms: 1000,
                backoff_max_ms: 2000,
            },
        }
    }
}

struct ActiveTarget {
    record: TrackedTarget,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ServiceInner {
    db: Database,
    monitor: NetworkMonitor,
    analysis: AnalysisHandle,
    adapters: HashMap<Channel, Arc<dyn PlatformAdapter>>,
    routers: HashMap<Channel, ReceiptRouter>,
    probe_method: Arc<RwLock<ProbeMethod>>,
    active: Mutex<HashMap<String, ActiveTarget>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TrackerService {
    inner: Arc<ServiceInner>,
}

impl TrackerService {
    pub fn new(
        db: Database,
        monitor: NetworkMonitor,
        analysis: AnalysisHandle,
        adapters: Vec<Arc<dyn PlatformAdapter>>,
    ) -> Self {
        let cancel = CancellationToken::new();

        let routers = adapters
            .iter()
            .map(|adapter| {
                (
                    adapter.channel(),
                    ReceiptRouter::spawn(adapter, cancel.child_token()),
                )
            })
            .collect();
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.channel(), adapter))
            .collect();

        Self {
            inner: Arc::new(ServiceInner {
                db,
                monitor,
                analysis,
                adapters,
                routers,
                probe_method: Arc::new(RwLock::new(ProbeMethod::Delete)),
                active: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    fn adapter(&self, channel: Channel) -> Result<&Arc<dyn PlatformAdapter>> {
        match self.inner.adapters.get(&channel) {
            Some(adapter) => Ok(adapter),
            None => bail!("no adapter configured for {channel}"),
        }
    }

    pub fn channel_available(&self, channel: Channel) -> bool {
        self.inner
            .adapters
            .get(&channel)
            .map(|adapter| adapter.is_available())
            .unwrap_or(false)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.adapters.keys().copied().collect()
    }

    /// Resolve an identifier, persist the tracking entry, and start the
    /// probe loop. Rejects already-tracked targets.
    pub async fn add_target(&self, identifier: &str, channel: Channel) -> Result<TrackedTarget> {
        let adapter = self.adapter(channel)?;
        let target_id = adapter.resolve_target(identifier)?;

        let mut active = self.inner.active.lock().await;
        if active.contains_key(&target_id) {
            bail!("target {target_id} is already tracked");
        }

        let record = TrackedTarget {
            target_id: target_id.clone(),
            channel,
            identifier: identifier.to_string(),
            added_at_ms: clock::now_ms(),
        };
        self.inner.db.insert_tracked_target(&record).await?;

        let entry = self.spawn_loop(record.clone())?;
        active.insert(target_id.clone(), entry);

        info!("Tracking {target_id} on {channel}");
        Ok(record)
    }

    /// Stop probing a target. Cooperative: an in-flight probe is discarded
    /// without appending a row, so the call completes within one probe
    /// timeout. Historical data stays.
    pub async fn remove_target(&self, target_id: &str) -> Result<TrackedTarget> {
        let Some(entry) = self.inner.active.lock().await.remove(target_id) else {
            bail!("target {target_id} is not tracked");
        };

        entry.cancel.cancel();
        if let Err(err) = entry.handle.await {
            error!("Probe loop for {target_id} failed to join: {err:?}");
        }

        self.inner.db.delete_tracked_target(target_id).await?;

        info!("Stopped tracking {target_id}");
        Ok(entry.record)
    }

    pub async fn list_targets(&self) -> Vec<TrackedTarget> {
        let active = self.inner.active.lock().await;
        let mut targets: Vec<TrackedTarget> =
            active.values().map(|entry| entry.record.clone()).collect();
        targets.sort_by_key(|record| record.added_at_ms);
        targets
    }

    pub async fn set_probe_method(&self, method: ProbeMethod) {
        *self.inner.probe_method.write().await = method;
        info!("Probe method set to {method}");
    }

    pub async fn probe_method(&self) -> ProbeMethod {
        *self.inner.probe_method.read().await
    }

    pub async fn get_display_metadata(
        &self,
        target_id: &str,
        channel: Channel,
    ) -> Result<Option<DisplayMetadata>, AdapterError> {
        match self.inner.adapters.get(&channel) {
            Some(adapter) => adapter.get_display_metadata(target_id).await,
            None => Ok(None),
        }
    }

    /// Resume probe loops for targets persisted by an earlier run.
    pub async fn resume_tracked(&self) -> Result<usize> {
        let records = self.inner.db.list_tracked_targets().await?;
        let mut active = self.inner.active.lock().await;
        let mut resumed = 0;

        for record in records {
            if active.contains_key(&record.target_id) {
                continue;
            }
            match self.spawn_loop(record.clone()) {
                Ok(entry) => {
                    active.insert(record.target_id.clone(), entry);
                    resumed += 1;
                }
                Err(err) => {
                    error!("Cannot resume {}: {err}", record.target_id);
                }
            }
        }

        if resumed > 0 {
            info!("Resumed tracking {resumed} target(s)");
        }
        Ok(resumed)
    }

    /// Cancel every probe loop and wait for them to drain.
    pub async fn stop_all(&self) {
        self.inner.cancel.cancel();

        let mut active = self.inner.active.lock().await;
        for (target_id, entry) in active.drain() {
            entry.cancel.cancel();
            if let Err(err) = entry.handle.await {
                error!("Probe loop for {target_id} failed to join: {err:?}");
            }
        }
    }

    fn spawn_loop(&self, record: TrackedTarget) -> Result<ActiveTarget> {
        let adapter = Arc::clone(self.adapter(record.channel)?);
        let router = match self.inner.routers.get(&record.channel) {
            Some(router) => router.clone(),
            None => bail!("no receipt router for {}", record.channel),
        };

        let cancel = self.inner.cancel.child_token();
        let probe_loop = ProbeLoop {
            target_id: record.target_id.clone(),
            channel: record.channel,
            adapter,
            db: self.inner.db.clone(),
            monitor: self.inner.monitor.clone(),
            analysis: self.inner.analysis.clone(),
            router,
            probe_method: Arc::clone(&self.inner.probe_method),
            timing: ChannelTiming::for_channel(record.channel),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(probe_loop.run());

        Ok(ActiveTarget {
            record,
            cancel,
            handle,
        })
    }
}
