//! Analysis engine.
//!
//! Consumes measurement-completed notifications from the scheduler plus a
//! periodic sweep, recomputes per-target baselines, scores the most recent
//! window, and appends one derived `analysis_windows` row per run. Runs for
//! all targets are serialized through a single consumer task so the newest
//! analysis row is deterministic.

mod scoring;
pub mod stats;

pub use scoring::{derive_state, score_window, TrackerState, WindowScores};

use std::collections::HashMap;

use anyhow::Result;
use log::{debug, error};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::adapters::Channel;
use crate::db::{AnalysisWindow, Baseline, Database};
use crate::hub::UpdatePayload;
use crate::utils::clock;

const ANALYSIS_WINDOW_MS: i64 = 60_000;
const SWEEP_INTERVAL_SECS: u64 = 60;
const BASELINE_SAMPLE_LIMIT: u32 = 1000;
const BASELINE_MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub target_id: String,
    pub channel: Channel,
}

/// Cheap handle the scheduler uses to request a re-analysis after each
/// completed measurement. Fire-and-forget: a gone engine is logged, never
/// an error in the measurement path.
#[derive(Clone)]
pub struct AnalysisHandle {
    tx: mpsc::UnboundedSender<AnalysisRequest>,
}

impl AnalysisHandle {
    pub fn notify(&self, target_id: &str, channel: Channel) {
        let request = AnalysisRequest {
            target_id: target_id.to_string(),
            channel,
        };
        if self.tx.send(request).is_err() {
            debug!("Analysis engine is gone; dropping request for {target_id}");
        }
    }
}

pub struct AnalysisEngine {
    db: Database,
    updates: broadcast::Sender<UpdatePayload>,
    /// Read-through cache of the store's baselines; never authoritative.
    baselines: HashMap<String, Baseline>,
}

impl AnalysisEngine {
    pub fn new(db: Database, updates: broadcast::Sender<UpdatePayload>) -> Self {
        Self {
            db,
            updates,
            baselines: HashMap::new(),
        }
    }

    /// Spawn the engine task. Returns the notification handle and the task
    /// handle; the task exits when `cancel` fires.
    pub fn spawn(
        db: Database,
        updates: broadcast::Sender<UpdatePayload>,
        cancel: CancellationToken,
    ) -> (AnalysisHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AnalysisRequest>();
        let mut engine = AnalysisEngine::new(db, updates);

        let handle = tokio::spawn(async move {
            let mut sweep = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Analysis engine shutting down");
                        break;
                    }
                    request = rx.recv() => {
                        match request {
                            Some(request) => {
                                engine.run_for_target(&request.target_id, request.channel).await;
                            }
                            None => break,
                        }
                    }
                    _ = sweep.tick() => {
                        engine.run_sweep().await;
                    }
                }
            }
        });

        (AnalysisHandle { tx }, handle)
    }

    /// Re-analyze every tracked target. Target list comes from the store so
    /// a restarted process sweeps the same set it resumes probing.
    pub async fn run_sweep(&mut self) {
        let targets = match self.db.list_tracked_targets().await {
            Ok(targets) => targets,
            Err(err) => {
                error!("Analysis sweep could not list targets: {err:?}");
                return;
            }
        };

        for target in targets {
            self.run_for_target(&target.target_id, target.channel).await;
        }
    }

    pub async fn run_for_target(&mut self, target_id: &str, channel: Channel) {
        if let Err(err) = self.try_run(target_id, channel).await {
            // Inference failures stay in the inference layer.
            error!("Analysis run failed for {target_id}: {err:?}");
        }
    }

    async fn try_run(&mut self, target_id: &str, channel: Channel) -> Result<()> {
        self.update_baseline(target_id, channel).await?;

        let baseline = match self.baselines.get(target_id) {
            Some(cached) => Some(cached.clone()),
            None => {
                let stored = self.db.get_baseline(target_id).await?;
                if let Some(ref baseline) = stored {
                    self.baselines
                        .insert(target_id.to_string(), baseline.clone());
                }
                stored
            }
        };

        let end_ms = clock::now_ms();
        let start_ms = end_ms - ANALYSIS_WINDOW_MS;
        let rows = self
            .db
            .get_raw_in_window(target_id, channel, start_ms, end_ms)
            .await?;

        if rows.is_empty() && baseline.is_none() {
            // Nothing measured and nothing learned yet; leave any prior
            // analysis intact rather than appending an empty verdict.
            debug!("Insufficient data for {target_id}; skipping analysis");
            return Ok(());
        }

        let scores = score_window(&rows, baseline.as_ref());
        let state = derive_state(&scores);

        let window = AnalysisWindow {
            id: None,
            target_id: target_id.to_string(),
            channel,
            start_ms,
            end_ms,
            sample_count: scores.sample_count,
            noise_score: scores.noise,
            responsiveness_score: scores.responsiveness,
            confidence_score: scores.confidence,
            derived_state: state,
        };
        self.db.append_analysis_window(&window).await?;

        let latest = rows.last();
        let payload = UpdatePayload {
            target_id: target_id.to_string(),
            channel,
            rtt_ms: latest.and_then(|row| row.target_rtt_ms),
            timestamp_ms: latest.map(|row| row.timestamp_ms),
            state,
            confidence: scores.confidence,
            noise: scores.noise,
            responsiveness: scores.responsiveness,
            median: baseline.as_ref().map(|b| b.median_rtt_ms),
            threshold: baseline.as_ref().map(|b| b.threshold_ms()),
        };
        // No subscribers is fine; the next connection gets fresh state.
        let _ = self.updates.send(payload);

        Ok(())
    }

    /// Relearn the baseline from the most recent successful RTTs. Fewer
    /// than the minimum leaves the existing baseline untouched.
    async fn update_baseline(&mut self, target_id: &str, channel: Channel) -> Result<()> {
        let rtts = self
            .db
            .get_recent_success_rtts(target_id, channel, BASELINE_SAMPLE_LIMIT)
            .await?;

        if rtts.len() < BASELINE_MIN_SAMPLES {
            return Ok(());
        }

        let mut sorted = rtts;
        sorted.sort_unstable();

        let min_rtt_ms = sorted[0];
        let median_rtt_ms = stats::median_of_sorted(&sorted);
        let iqr_ms = stats::iqr_of_sorted(&sorted);

        let baseline = Baseline {
            target_id: target_id.to_string(),
            channel,
            min_rtt_ms,
            median_rtt_ms,
            iqr_ms,
            updated_at_ms: clock::now_ms(),
            sample_count: u32::try_from(sorted.len()).unwrap_or(u32::MAX),
        };

        self.db.upsert_baseline(&baseline).await?;
        self.baselines.insert(target_id.to_string(), baseline);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    use super::*;
    use crate::adapters::ProbeMethod;
    use crate::db::Measurement;
    use crate::utils::clock;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("tracker.db")).expect("open db");
        (dir, db)
    }

    fn raw_row(ts: i64, rtt: Option<u64>, local: Option<u64>) -> Measurement {
        Measurement {
            id: None,
            target_id: "t1".to_string(),
            channel: Channel::Whatsapp,
            timestamp_ms: ts,
            target_rtt_ms: rtt,
            timeout: rtt.is_none(),
            local_network_rtt_ms: local,
            probe_method: ProbeMethod::Delete,
        }
    }

    #[tokio::test]
    async fn run_learns_baseline_and_appends_analysis() {
        let (_dir, db) = open_test_db();
        let (updates, mut update_rx) = broadcast::channel(16);
        let mut engine = AnalysisEngine::new(db.clone(), updates);

        // Twelve recent successes, all inside the analysis window.
        let now = clock::now_ms();
        for i in 0..12 {
            db.append_measurement(&raw_row(now - 30_000 + i * 1000, Some(100 + i as u64), Some(10)))
                .await
                .expect("append");
        }

        engine.run_for_target("t1", Channel::Whatsapp).await;

        let baseline = db
            .get_baseline("t1")
            .await
            .expect("query")
            .expect("baseline learned");
        assert_eq!(baseline.sample_count, 12);
        assert_eq!(baseline.min_rtt_ms, 100);

        let analysis = db
            .get_latest_analysis("t1")
            .await
            .expect("query")
            .expect("analysis appended");
        assert_eq!(analysis.sample_count, 12);
        assert!(analysis.confidence_score > 0.6);

        let payload = update_rx.try_recv().expect("update published");
        assert_eq!(payload.target_id, "t1");
        assert_eq!(payload.state, analysis.derived_state);
        assert_eq!(payload.median, Some(baseline.median_rtt_ms));
    }

    #[tokio::test]
    async fn below_minimum_samples_learns_no_baseline() {
        let (_dir, db) = open_test_db();
        let (updates, _update_rx) = broadcast::channel(16);
        let mut engine = AnalysisEngine::new(db.clone(), updates);

        let now = clock::now_ms();
        for i in 0..5 {
            db.append_measurement(&raw_row(now - 10_000 + i * 1000, Some(120), Some(10)))
                .await
                .expect("append");
        }

        engine.run_for_target("t1", Channel::Whatsapp).await;

        assert!(db.get_baseline("t1").await.expect("query").is_none());
        // The window itself still gets scored (fast path applies).
        let analysis = db
            .get_latest_analysis("t1")
            .await
            .expect("query")
            .expect("analysis appended");
        assert_eq!(analysis.derived_state, TrackerState::Online);
        assert_eq!(analysis.confidence_score, 0.8);
    }

    #[tokio::test]
    async fn empty_window_without_baseline_leaves_prior_analysis_intact() {
        let (_dir, db) = open_test_db();
        let (updates, _update_rx) = broadcast::channel(16);
        let mut engine = AnalysisEngine::new(db.clone(), updates);

        engine.run_for_target("ghost", Channel::Signal).await;

        assert!(db.get_latest_analysis("ghost").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn rerunning_a_window_reproduces_identical_scores() {
        let (_dir, db) = open_test_db();
        let (updates, _update_rx) = broadcast::channel(16);
        let mut engine = AnalysisEngine::new(db.clone(), updates);

        let now = clock::now_ms();
        for i in 0..8 {
            let rtt = if i % 3 == 0 { None } else { Some(110 + i as u64 * 7) };
            db.append_measurement(&raw_row(now - 20_000 + i * 1000, rtt, Some(12)))
                .await
                .expect("append");
        }

        engine.run_for_target("t1", Channel::Whatsapp).await;
        let first = db
            .get_latest_analysis("t1")
            .await
            .expect("query")
            .expect("first run");

        // Re-score the stored window straight from raw rows.
        let rows = db
            .get_raw_in_window("t1", Channel::Whatsapp, first.start_ms, first.end_ms)
            .await
            .expect("window rows");
        let baseline = db.get_baseline("t1").await.expect("query");
        let scores = score_window(&rows, baseline.as_ref());

        assert_eq!(scores.noise, first.noise_score);
        assert_eq!(scores.responsiveness, first.responsiveness_score);
        assert_eq!(scores.confidence, first.confidence_score);
        assert_eq!(derive_state(&scores), first.derived_state);
    }
}
