use serde::{Deserialize, Serialize};

use crate::adapters::Channel;

/// A target the scheduler is (or should resume) probing. The original
/// user-entered identifier is kept for display; `target_id` is canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTarget {
    pub target_id: String,
    pub channel: Channel,
    pub identifier: String,
    pub added_at_ms: i64,
}
