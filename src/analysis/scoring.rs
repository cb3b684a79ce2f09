//! Window scoring and state derivation.
//!
//! Everything here is a pure function of the raw rows and the baseline, so
//! any historical window can be re-scored and must come out identical.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::stats::iqr_of_sorted;
use crate::db::{Baseline, Measurement};

/// Spread of |target − local| (in ms) at which the noise score saturates.
const NOISE_IQR_CEILING_MS: f64 = 500.0;

/// Noise above this gates the whole window: confidence drops to zero.
const NOISE_GATE: f64 = 0.5;

/// Fast path: with no baseline yet, every known-RTT sample must normalize
/// below this for the window to still earn provisional confidence.
const FAST_PATH_RTT_CEILING_MS: i64 = 1000;

const MIN_WINDOW_SAMPLES: usize = 3;
const CONFIDENCE_FLOOR: f64 = 0.6;

/// Gated assessment of a target's responsiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    Online,
    Standby,
    #[serde(rename = "OFFLINE")]
    Offline,
    Unknown,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Online => "Online",
            TrackerState::Standby => "Standby",
            TrackerState::Offline => "OFFLINE",
            TrackerState::Unknown => "Unknown",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Online" => Ok(TrackerState::Online),
            "Standby" => Ok(TrackerState::Standby),
            "OFFLINE" => Ok(TrackerState::Offline),
            "Unknown" => Ok(TrackerState::Unknown),
            other => Err(anyhow!("unknown tracker state {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowScores {
    pub sample_count: u32,
    pub noise: f64,
    pub responsiveness: f64,
    pub confidence: f64,
    pub fast_path: bool,
}

/// Score one analysis window. Deterministic: the same rows and baseline
/// always produce the same scores.
pub fn score_window(rows: &[Measurement], baseline: Option<&Baseline>) -> WindowScores {
    let noise = noise_score(rows);
    let responsiveness = responsiveness_score(rows, baseline);

    let samples = rows.len();
    let mut confidence = 1.0;
    let mut fast_path = false;

    if baseline.is_none() {
        // Provisional confidence: enough samples, and nothing slow among
        // the RTTs we actually know. Timeout rows carry no RTT and do not
        // disqualify.
        let all_known_fast = rows
            .iter()
            .filter_map(|row| row.target_rtt_ms.map(|rtt| (rtt, row.local_network_rtt_ms)))
            .all(|(rtt, local)| {
                (rtt as i64 - local.unwrap_or(0) as i64) < FAST_PATH_RTT_CEILING_MS
            });

        if samples >= MIN_WINDOW_SAMPLES && all_known_fast {
            confidence = 0.8;
            fast_path = true;
        } else {
            confidence *= 0.1;
        }
    }

    // Noise gating is non-negotiable and applies after the fast path.
    if noise > NOISE_GATE {
        confidence *= 0.0;
    }
    if samples < MIN_WINDOW_SAMPLES {
        confidence *= 0.5;
    }

    WindowScores {
        sample_count: u32::try_from(samples).unwrap_or(u32::MAX),
        noise,
        responsiveness,
        confidence,
        fast_path,
    }
}

/// IQR of |target − local| across rows carrying both values, normalized
/// against the saturation ceiling.
fn noise_score(rows: &[Measurement]) -> f64 {
    let mut diffs: Vec<u64> = rows
        .iter()
        .filter_map(|row| match (row.target_rtt_ms, row.local_network_rtt_ms) {
            (Some(target), Some(local)) => Some(target.abs_diff(local)),
            _ => None,
        })
        .collect();

    if diffs.len() < 2 {
        return 0.0;
    }

    diffs.sort_unstable();
    (iqr_of_sorted(&diffs) as f64 / NOISE_IQR_CEILING_MS).min(1.0)
}

/// Weighted fraction of samples meeting the baseline-relative threshold.
/// Timeouts count as zero; successes without a baseline are skipped.
fn responsiveness_score(rows: &[Measurement], baseline: Option<&Baseline>) -> f64 {
    let mut total = 0.0;
    let mut valid = 0u32;

    for row in rows {
        if row.timeout {
            valid += 1;
            continue;
        }

        let Some(target_rtt) = row.target_rtt_ms else {
            continue;
        };
        let Some(baseline) = baseline else {
            continue;
        };

        let local = row.local_network_rtt_ms.unwrap_or(0);
        let normalized = target_rtt.saturating_sub(local) as f64;
        let threshold = baseline.threshold_ms();

        total += if normalized <= threshold {
            1.0
        } else if normalized <= 2.0 * threshold {
            0.5
        } else {
            0.1
        };
        valid += 1;
    }

    if valid > 0 {
        total / valid as f64
    } else {
        0.0
    }
}

/// Map window scores to the gated state label.
pub fn derive_state(scores: &WindowScores) -> TrackerState {
    if scores.confidence <= CONFIDENCE_FLOOR {
        return TrackerState::Unknown;
    }
    // The fast path vouches for the window even though responsiveness
    // cannot be computed without a baseline.
    if scores.responsiveness == 0.0 && !scores.fast_path {
        return TrackerState::Offline;
    }
    if scores.responsiveness > 0.8 || scores.fast_path {
        return TrackerState::Online;
    }
    TrackerState::Standby
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Channel, ProbeMethod};

    fn row(ts: i64, rtt: Option<u64>, local: Option<u64>) -> Measurement {
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

    fn baseline(median: f64, iqr: u64) -> Baseline {
        Baseline {
            target_id: "t1".to_string(),
            channel: Channel::Whatsapp,
            min_rtt_ms: 80,
            median_rtt_ms: median,
            iqr_ms: iqr,
            updated_at_ms: 0,
            sample_count: 20,
        }
    }

    #[test]
    fn no_baseline_low_latency_takes_fast_path_online() {
        let rtts = [120u64, 140, 130, 110, 125];
        let locals = [20u64, 25, 22, 18, 24];
        let rows: Vec<Measurement> = rtts
            .iter()
            .zip(locals.iter())
            .enumerate()
            .map(|(i, (rtt, local))| row((i as i64 + 1) * 1000, Some(*rtt), Some(*local)))
            .collect();

        let scores = score_window(&rows, None);
        assert!(scores.noise <= 0.5);
        assert!(scores.fast_path);
        assert_eq!(scores.confidence, 0.8);
        assert_eq!(scores.responsiveness, 0.0);
        assert_eq!(derive_state(&scores), TrackerState::Online);
    }

    #[test]
    fn high_noise_gates_to_unknown() {
        // Alternating |target − local| of 50 and 700 ms.
        let rows: Vec<Measurement> = (0..10)
            .map(|i| {
                let diff = if i % 2 == 0 { 50 } else { 700 };
                row((i + 1) * 1000, Some(100 + diff), Some(100))
            })
            .collect();

        let scores = score_window(&rows, Some(&baseline(150.0, 30)));
        assert_eq!(scores.noise, 1.0);
        assert_eq!(scores.confidence, 0.0);
        assert_eq!(derive_state(&scores), TrackerState::Unknown);
    }

    #[test]
    fn all_timeouts_with_baseline_derive_offline() {
        let rows: Vec<Measurement> = (0..5).map(|i| row((i + 1) * 1000, None, Some(20))).collect();

        let scores = score_window(&rows, Some(&baseline(150.0, 30)));
        assert_eq!(scores.responsiveness, 0.0);
        assert_eq!(scores.noise, 0.0);
        assert!(scores.confidence >= 0.6);
        assert_eq!(derive_state(&scores), TrackerState::Offline);
    }

    #[test]
    fn responsive_under_threshold_derives_online() {
        // threshold = 150 + 1.5·40 = 210; all normalized values stay below.
        let rtts = [190u64, 200, 180, 205, 195];
        let rows: Vec<Measurement> = rtts
            .iter()
            .enumerate()
            .map(|(i, rtt)| row((i as i64 + 1) * 1000, Some(*rtt), Some(20)))
            .collect();

        let scores = score_window(&rows, Some(&baseline(150.0, 40)));
        assert_eq!(scores.responsiveness, 1.0);
        assert!(scores.confidence > 0.6);
        assert_eq!(derive_state(&scores), TrackerState::Online);
    }

    #[test]
    fn middling_responsiveness_falls_back_to_standby() {
        // threshold = 100; two rows at 1.0 weight, two timeouts at 0.
        let rows = vec![
            row(1000, Some(80), Some(0)),
            row(2000, Some(90), Some(0)),
            row(3000, None, Some(0)),
            row(4000, None, Some(0)),
        ];

        let scores = score_window(&rows, Some(&baseline(70.0, 20)));
        assert_eq!(scores.responsiveness, 0.5);
        assert!(scores.confidence > 0.6);
        assert_eq!(derive_state(&scores), TrackerState::Standby);
    }

    #[test]
    fn sparse_window_halves_confidence() {
        let rows = vec![row(1000, Some(100), Some(10)), row(2000, Some(110), Some(10))];

        let scores = score_window(&rows, Some(&baseline(150.0, 30)));
        assert_eq!(scores.confidence, 0.5);
        assert_eq!(derive_state(&scores), TrackerState::Unknown);
    }

    #[test]
    fn no_baseline_without_fast_path_is_penalized() {
        // Uniformly slow samples: quiet (low IQR) but every normalized RTT
        // sits above the fast-path ceiling.
        let rows = vec![
            row(1000, Some(1100), Some(10)),
            row(2000, Some(1050), Some(10)),
            row(3000, Some(1080), Some(10)),
            row(4000, Some(1120), Some(10)),
        ];

        let scores = score_window(&rows, None);
        assert!(scores.noise <= 0.5);
        assert!(!scores.fast_path);
        assert!((scores.confidence - 0.1).abs() < f64::EPSILON);
        assert_eq!(derive_state(&scores), TrackerState::Unknown);
    }

    #[test]
    fn timeout_rows_do_not_disqualify_fast_path() {
        let rows = vec![
            row(1000, Some(120), Some(10)),
            row(2000, None, Some(10)),
            row(3000, Some(130), Some(10)),
        ];

        let scores = score_window(&rows, None);
        assert!(scores.fast_path);
        assert_eq!(scores.confidence, 0.8);
    }

    #[test]
    fn scoring_is_recomputable() {
        let rows: Vec<Measurement> = (0..7)
            .map(|i| row((i + 1) * 1000, Some(100 + (i as u64 * 13) % 90), Some(15)))
            .collect();
        let b = baseline(140.0, 25);

        let first = score_window(&rows, Some(&b));
        let second = score_window(&rows, Some(&b));
        assert_eq!(first.noise, second.noise);
        assert_eq!(first.responsiveness, second.responsiveness);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(derive_state(&first), derive_state(&second));
    }

    #[test]
    fn gating_invariant_holds_for_low_confidence() {
        // Empty window, no baseline: confidence is 0.1 · 0.5 = 0.05.
        let scores = score_window(&[], None);
        assert!(scores.confidence < 0.6);
        assert_eq!(derive_state(&scores), TrackerState::Unknown);
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            TrackerState::Online,
            TrackerState::Standby,
            TrackerState::Offline,
            TrackerState::Unknown,
        ] {
            assert_eq!(TrackerState::parse(state.as_str()).unwrap(), state);
        }
        assert_eq!(TrackerState::Offline.as_str(), "OFFLINE");
        assert!(TrackerState::parse("Lurking").is_err());
    }
}
