//! Local-network control monitor.
//!
//! Continuously probes a fixed reference endpoint so the analysis engine
//! can tell host-side latency apart from target-side latency. Target
//! measurements snapshot `current_rtt()` at probe start.

mod loop_worker;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::stats::population_std_dev;
use crate::db::Database;

pub const DEFAULT_REFERENCE_TARGET: &str = "1.1.1.1:80";

const SAMPLE_WINDOW: usize = 50;
const MIN_SAMPLES_FOR_VARIANCE: usize = 6;

/// Rolling window of the last reference probes. `None` entries are failed
/// or timed-out probes.
pub(crate) struct SampleWindow {
    samples: VecDeque<Option<u64>>,
}

impl SampleWindow {
    pub(crate) fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    pub(crate) fn push(&mut self, rtt_ms: Option<u64>) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub(crate) fn latest(&self) -> Option<u64> {
        self.samples.back().copied().flatten()
    }

    pub(crate) fn loss_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let lost = self.samples.iter().filter(|s| s.is_none()).count();
        lost as f64 / self.samples.len() as f64
    }

    /// Population standard deviation of the valid RTTs, rounded to whole
    /// milliseconds. Too few valid samples reads as perfectly steady.
    pub(crate) fn variance_ms(&self) -> u64 {
        let valid: Vec<u64> = self.samples.iter().copied().flatten().collect();
        if valid.len() < MIN_SAMPLES_FOR_VARIANCE {
            return 0;
        }
        population_std_dev(&valid).round() as u64
    }
}

struct MonitorInner {
    db: Database,
    reference_target: String,
    window: Mutex<SampleWindow>,
    runner: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Singleton control monitor with idempotent `start`/`stop`. The handle is
/// cheap to clone; `current_rtt` and `current_loss_rate` never touch I/O.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(db: Database, reference_target: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                db,
                reference_target: reference_target.into(),
                window: Mutex::new(SampleWindow::new()),
                runner: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) {
        let mut runner = self.inner.runner.lock().await;
        if runner.is_some() {
            return;
        }

        info!(
            "Starting network monitor against {}",
            self.inner.reference_target
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(loop_worker::monitor_loop(
            Arc::clone(&self.inner),
            cancel.clone(),
        ));
        *runner = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let mut runner = self.inner.runner.lock().await;
        let Some((cancel, handle)) = runner.take() else {
            return;
        };

        cancel.cancel();
        if let Err(err) = handle.await {
            log::error!("Network monitor task failed to join: {err:?}");
        }
    }

    /// RTT of the latest reference probe, or `None` after a failed probe
    /// (or before the first one).
    pub fn current_rtt(&self) -> Option<u64> {
        match self.inner.window.lock() {
            Ok(window) => window.latest(),
            Err(poisoned) => poisoned.into_inner().latest(),
        }
    }

    pub fn current_loss_rate(&self) -> f64 {
        match self.inner.window.lock() {
            Ok(window) => window.loss_rate(),
            Err(poisoned) => poisoned.into_inner().loss_rate(),
        }
    }
}
