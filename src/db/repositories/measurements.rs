use anyhow::Result;
use rusqlite::{params, Row};

use crate::adapters::{Channel, ProbeMethod};
use crate::db::{
    connection::Database,
    helpers::{to_optional_i64, to_optional_u64, with_busy_retry},
    models::Measurement,
};

fn row_to_measurement(row: &Row) -> Result<Measurement> {
    let channel: String = row.get("channel")?;
    let probe_method: String = row.get("probe_method")?;
    let target_rtt_ms: Option<i64> = row.get("target_rtt_ms")?;
    let local_network_rtt_ms: Option<i64> = row.get("local_network_rtt_ms")?;

    Ok(Measurement {
        id: row.get("id")?,
        target_id: row.get("target_id")?,
        channel: Channel::parse(&channel)?,
        timestamp_ms: row.get("timestamp_ms")?,
        target_rtt_ms: to_optional_u64(target_rtt_ms, "target_rtt_ms")?,
        timeout: row.get("timeout")?,
        local_network_rtt_ms: to_optional_u64(local_network_rtt_ms, "local_network_rtt_ms")?,
        probe_method: ProbeMethod::parse(&probe_method)?,
    })
}

impl Database {
    pub async fn append_measurement(&self, measurement: &Measurement) -> Result<()> {
        let record = measurement.clone();
        self.execute(move |conn| {
            let target_rtt_ms = to_optional_i64(record.target_rtt_ms)?;
            let local_network_rtt_ms = to_optional_i64(record.local_network_rtt_ms)?;
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO raw_measurements (
                        target_id,
                        channel,
                        timestamp_ms,
                        target_rtt_ms,
                        timeout,
                        local_network_rtt_ms,
                        probe_method
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.target_id,
                        record.channel.as_str(),
                        record.timestamp_ms,
                        target_rtt_ms,
                        record.timeout,
                        local_network_rtt_ms,
                        record.probe_method.as_str(),
                    ],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }

    /// Most-recent successful RTTs for a target, newest first.
    pub async fn get_recent_success_rtts(
        &self,
        target_id: &str,
        channel: Channel,
        limit: u32,
    ) -> Result<Vec<u64>> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT target_rtt_ms
                 FROM raw_measurements
                 WHERE target_id = ?1
                   AND channel = ?2
                   AND timeout = 0
                   AND target_rtt_ms IS NOT NULL
                 ORDER BY timestamp_ms DESC
                 LIMIT ?3",
            )?;

            let rows = stmt.query_map(params![target_id, channel.as_str(), limit], |row| {
                row.get::<_, i64>(0)
            })?;

            let mut rtts = Vec::new();
            for value in rows {
                rtts.push(u64::try_from(value?).unwrap_or(0));
            }
            Ok(rtts)
        })
        .await
    }

    /// Raw rows in [start_ms, end_ms], chronological.
    pub async fn get_raw_in_window(
        &self,
        target_id: &str,
        channel: Channel,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Measurement>> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_id, channel, timestamp_ms, target_rtt_ms,
                        timeout, local_network_rtt_ms, probe_method
                 FROM raw_measurements
                 WHERE target_id = ?1
                   AND channel = ?2
                   AND timestamp_ms >= ?3
                   AND timestamp_ms <= ?4
                 ORDER BY timestamp_ms ASC",
            )?;

            let rows = stmt.query_and_then(
                params![target_id, channel.as_str(), start_ms, end_ms],
                row_to_measurement,
            )?;

            rows.collect()
        })
        .await
    }

    /// Distinct civil dates (host local time) with raw rows, newest first.
    pub async fn get_available_days(&self, target_id: &str) -> Result<Vec<String>> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT date(timestamp_ms / 1000, 'unixepoch', 'localtime') AS day
                 FROM raw_measurements
                 WHERE target_id = ?1
                 ORDER BY day DESC",
            )?;

            let rows = stmt.query_map(params![target_id], |row| row.get::<_, String>(0))?;

            let mut days = Vec::new();
            for day in rows {
                days.push(day?);
            }
            Ok(days)
        })
        .await
    }

    /// Chronological raw rows falling on the given local civil date
    /// (`YYYY-MM-DD`).
    pub async fn get_raw_for_day(
        &self,
        target_id: &str,
        local_date: &str,
    ) -> Result<Vec<Measurement>> {
        let target_id = target_id.to_string();
        let local_date = local_date.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_id, channel, timestamp_ms, target_rtt_ms,
                        timeout, local_network_rtt_ms, probe_method
                 FROM raw_measurements
                 WHERE target_id = ?1
                   AND date(timestamp_ms / 1000, 'unixepoch', 'localtime') = ?2
                 ORDER BY timestamp_ms ASC",
            )?;

            let rows = stmt.query_and_then(params![target_id, local_date], row_to_measurement)?;

            rows.collect()
        })
        .await
    }
}
