//! Raw measurement data model.
//!
//! Represents one completed probe cycle: either an acknowledged delivery
//! with its round-trip time, or a timeout. Rows are append-only.

use serde::{Deserialize, Serialize};

use crate::adapters::{Channel, ProbeMethod};

/// One completed probe cycle toward a target.
///
/// Invariant: `timeout` is true exactly when `target_rtt_ms` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub id: Option<i64>,
    pub target_id: String,
    pub channel: Channel,
    pub timestamp_ms: i64,
    pub target_rtt_ms: Option<u64>,
    pub timeout: bool,
    /// Snapshot of the local-network control RTT at probe start.
    pub local_network_rtt_ms: Option<u64>,
    pub probe_method: ProbeMethod,
}
