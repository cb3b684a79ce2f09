//! pulsetrack — delivery-receipt RTT tracker.
//!
//! Probes messaging targets through platform bridges, records the
//! round-trip time of their delivery acknowledgements in an append-only
//! store, and derives a confidence-gated responsiveness assessment. Raw
//! measurements are never rewritten; every derived score can be recomputed
//! from them.

pub mod adapters;
pub mod analysis;
pub mod config;
pub mod db;
pub mod hub;
pub mod netmon;
pub mod scheduler;
pub mod utils;
