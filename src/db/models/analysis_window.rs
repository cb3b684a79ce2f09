use serde::{Deserialize, Serialize};

use crate::adapters::Channel;
use crate::analysis::TrackerState;

/// Derived scores for one analysis window. Append-only and re-derivable
/// from raw rows; the newest row per target wins for live display.
///
/// Invariant: `confidence_score < 0.6` implies `derived_state = Unknown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisWindow {
    pub id: Option<i64>,
    pub target_id: String,
    pub channel: Channel,
    pub start_ms: i64,
    pub end_ms: i64,
    pub sample_count: u32,
    pub noise_score: f64,
    pub responsiveness_score: f64,
    pub confidence_score: f64,
    pub derived_state: TrackerState,
}
