use serde::{Deserialize, Serialize};

/// One probe of the host's own network health against the reference
/// endpoint. Recorded every monitor interval regardless of tracker activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNetworkSample {
    pub id: Option<i64>,
    pub timestamp_ms: i64,
    pub rtt_ms: Option<u64>,
    pub timeout: bool,
    /// Population standard deviation of valid RTTs in the monitor's rolling
    /// window at record time.
    pub variance_ms: u64,
    pub packet_loss_rate: f64,
    pub reference_target: String,
}
