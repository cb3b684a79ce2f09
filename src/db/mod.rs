mod connection;
mod helpers;
mod migrations;
mod models;
mod repositories;

pub use connection::Database;
pub use models::{AnalysisWindow, Baseline, LocalNetworkSample, Measurement, TrackedTarget};

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::adapters::{Channel, ProbeMethod};
    use crate::analysis::TrackerState;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("tracker.db")).expect("open db");
        (dir, db)
    }

    fn raw_row(target: &str, ts: i64, rtt: Option<u64>, local: Option<u64>) -> Measurement {
        Measurement {
            id: None,
            target_id: target.to_string(),
            channel: Channel::Whatsapp,
            timestamp_ms: ts,
            target_rtt_ms: rtt,
            timeout: rtt.is_none(),
            local_network_rtt_ms: local,
            probe_method: ProbeMethod::Delete,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tracker.db");
        {
            let _db = Database::new(path.clone()).expect("first open");
        }
        // Second open re-runs migration bookkeeping against an up-to-date file.
        let _db = Database::new(path).expect("second open");
    }

    #[tokio::test]
    async fn timeout_duality_is_enforced_by_schema() {
        let (_dir, db) = open_test_db();

        let mut bad = raw_row("t1", 1000, Some(120), Some(20));
        bad.timeout = true;
        assert!(db.append_measurement(&bad).await.is_err());

        let mut also_bad = raw_row("t1", 1000, None, Some(20));
        also_bad.timeout = false;
        assert!(db.append_measurement(&also_bad).await.is_err());

        assert!(db
            .append_measurement(&raw_row("t1", 1000, Some(120), Some(20)))
            .await
            .is_ok());
        assert!(db
            .append_measurement(&raw_row("t1", 2000, None, Some(20)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn recent_success_rtts_are_newest_first_and_skip_timeouts() {
        let (_dir, db) = open_test_db();

        for (ts, rtt) in [(1000, Some(110)), (2000, None), (3000, Some(130)), (4000, Some(120))] {
            db.append_measurement(&raw_row("t1", ts, rtt, Some(10)))
                .await
                .expect("append");
        }

        let rtts = db
            .get_recent_success_rtts("t1", Channel::Whatsapp, 10)
            .await
            .expect("query");
        assert_eq!(rtts, vec![120, 130, 110]);

        let limited = db
            .get_recent_success_rtts("t1", Channel::Whatsapp, 2)
            .await
            .expect("query");
        assert_eq!(limited, vec![120, 130]);
    }

    #[tokio::test]
    async fn window_query_is_inclusive_and_chronological() {
        let (_dir, db) = open_test_db();

        for ts in [1000, 2000, 3000, 4000, 5000] {
            db.append_measurement(&raw_row("t1", ts, Some(100), Some(10)))
                .await
                .expect("append");
        }

        let rows = db
            .get_raw_in_window("t1", Channel::Whatsapp, 2000, 4000)
            .await
            .expect("query");
        let stamps: Vec<i64> = rows.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps, vec![2000, 3000, 4000]);
    }

    #[tokio::test]
    async fn baseline_upsert_replaces_by_target() {
        let (_dir, db) = open_test_db();

        let mut baseline = Baseline {
            target_id: "t1".to_string(),
            channel: Channel::Signal,
            min_rtt_ms: 90,
            median_rtt_ms: 150.0,
            iqr_ms: 30,
            updated_at_ms: 1000,
            sample_count: 12,
        };
        db.upsert_baseline(&baseline).await.expect("insert");

        baseline.median_rtt_ms = 160.0;
        baseline.sample_count = 20;
        baseline.updated_at_ms = 2000;
        db.upsert_baseline(&baseline).await.expect("replace");

        let stored = db.get_baseline("t1").await.expect("query").expect("exists");
        assert_eq!(stored.median_rtt_ms, 160.0);
        assert_eq!(stored.sample_count, 20);

        assert!(db.get_baseline("nobody").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn baseline_below_ten_samples_is_rejected() {
        let (_dir, db) = open_test_db();

        let baseline = Baseline {
            target_id: "t1".to_string(),
            channel: Channel::Signal,
            min_rtt_ms: 90,
            median_rtt_ms: 150.0,
            iqr_ms: 30,
            updated_at_ms: 1000,
            sample_count: 9,
        };
        assert!(db.upsert_baseline(&baseline).await.is_err());
    }

    #[tokio::test]
    async fn latest_analysis_is_newest_by_end_ms() {
        let (_dir, db) = open_test_db();

        for (start, end, state) in [
            (0, 60_000, TrackerState::Unknown),
            (60_000, 120_000, TrackerState::Online),
        ] {
            let window = AnalysisWindow {
                id: None,
                target_id: "t1".to_string(),
                channel: Channel::Whatsapp,
                start_ms: start,
                end_ms: end,
                sample_count: 5,
                noise_score: 0.1,
                responsiveness_score: 1.0,
                confidence_score: 0.9,
                derived_state: state,
            };
            db.append_analysis_window(&window).await.expect("append");
        }

        let latest = db
            .get_latest_analysis("t1")
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(latest.end_ms, 120_000);
        assert_eq!(latest.derived_state, TrackerState::Online);
    }

    #[tokio::test]
    async fn day_queries_bucket_by_local_date() {
        let (_dir, db) = open_test_db();

        // Noon UTC two days apart; noon keeps the local civil date stable
        // for any offset within ±11 hours.
        let day_one_noon =
            1_700_000_000_000_i64 - (1_700_000_000_000_i64 % 86_400_000) + 43_200_000;
        let day_two_noon = day_one_noon + 86_400_000;

        db.append_measurement(&raw_row("t1", day_one_noon, Some(100), Some(10)))
            .await
            .expect("append");
        db.append_measurement(&raw_row("t1", day_two_noon, Some(105), Some(10)))
            .await
            .expect("append");

        let days = db.get_available_days("t1").await.expect("days");
        assert_eq!(days.len(), 2);
        // Descending order: newest day first.
        assert!(days[0] > days[1]);

        let rows = db.get_raw_for_day("t1", &days[1]).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ms, day_one_noon);
    }

    #[tokio::test]
    async fn tracked_targets_round_trip() {
        let (_dir, db) = open_test_db();

        let target = TrackedTarget {
            target_id: "15551234567@s.whatsapp.net".to_string(),
            channel: Channel::Whatsapp,
            identifier: "+1 555 123 4567".to_string(),
            added_at_ms: 1000,
        };
        db.insert_tracked_target(&target).await.expect("insert");

        let listed = db.list_tracked_targets().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target_id, target.target_id);

        db.delete_tracked_target(&target.target_id)
            .await
            .expect("delete");
        assert!(db.list_tracked_targets().await.expect("list").is_empty());
    }
}
