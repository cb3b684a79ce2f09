use anyhow::Result;
use rusqlite::{params, Row};

use crate::adapters::Channel;
use crate::db::{
    connection::Database,
    helpers::{to_i64, to_u64, with_busy_retry},
    models::Baseline,
};

fn row_to_baseline(row: &Row) -> Result<Baseline> {
    let channel: String = row.get("channel")?;
    let min_rtt_ms: i64 = row.get("min_rtt_ms")?;
    let iqr_ms: i64 = row.get("iqr_ms")?;
    let sample_count: i64 = row.get("sample_count")?;

    Ok(Baseline {
        target_id: row.get("target_id")?,
        channel: Channel::parse(&channel)?,
        min_rtt_ms: to_u64(min_rtt_ms, "min_rtt_ms")?,
        median_rtt_ms: row.get("median_rtt_ms")?,
        iqr_ms: to_u64(iqr_ms, "iqr_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
        sample_count: u32::try_from(sample_count).unwrap_or(0),
    })
}

impl Database {
    pub async fn upsert_baseline(&self, baseline: &Baseline) -> Result<()> {
        let record = baseline.clone();
        self.execute(move |conn| {
            let min_rtt_ms = to_i64(record.min_rtt_ms)?;
            let iqr_ms = to_i64(record.iqr_ms)?;
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO baselines (
                        target_id,
                        channel,
                        min_rtt_ms,
                        median_rtt_ms,
                        iqr_ms,
                        updated_at_ms,
                        sample_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT (target_id) DO UPDATE SET
                        channel = excluded.channel,
                        min_rtt_ms = excluded.min_rtt_ms,
                        median_rtt_ms = excluded.median_rtt_ms,
                        iqr_ms = excluded.iqr_ms,
                        updated_at_ms = excluded.updated_at_ms,
                        sample_count = excluded.sample_count",
                    params![
                        record.target_id,
                        record.channel.as_str(),
                        min_rtt_ms,
                        record.median_rtt_ms,
                        iqr_ms,
                        record.updated_at_ms,
                        record.sample_count,
                    ],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }

    pub async fn get_baseline(&self, target_id: &str) -> Result<Option<Baseline>> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT target_id, channel, min_rtt_ms, median_rtt_ms,
                        iqr_ms, updated_at_ms, sample_count
                 FROM baselines
                 WHERE target_id = ?1",
            )?;

            let mut rows = stmt.query_and_then(params![target_id], row_to_baseline)?;
            rows.next().transpose()
        })
        .await
    }
}
