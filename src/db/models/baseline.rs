use serde::{Deserialize, Serialize};

use crate::adapters::Channel;

/// Per-target rolling statistical model over recent successful RTTs.
/// A baseline only exists once at least 10 successful samples were seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub target_id: String,
    pub channel: Channel,
    pub min_rtt_ms: u64,
    pub median_rtt_ms: f64,
    pub iqr_ms: u64,
    pub updated_at_ms: i64,
    pub sample_count: u32,
}

impl Baseline {
    /// Upper bound for a "normal" normalized RTT.
    pub fn threshold_ms(&self) -> f64 {
        self.median_rtt_ms + 1.5 * self.iqr_ms as f64
    }
}
