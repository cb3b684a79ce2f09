use anyhow::Result;
use rusqlite::{params, Row};

use crate::adapters::Channel;
use crate::db::{connection::Database, helpers::with_busy_retry, models::TrackedTarget};

fn row_to_tracked_target(row: &Row) -> Result<TrackedTarget> {
    let channel: String = row.get("channel")?;

    Ok(TrackedTarget {
        target_id: row.get("target_id")?,
        channel: Channel::parse(&channel)?,
        identifier: row.get("identifier")?,
        added_at_ms: row.get("added_at_ms")?,
    })
}

impl Database {
    pub async fn insert_tracked_target(&self, target: &TrackedTarget) -> Result<()> {
        let record = target.clone();
        self.execute(move |conn| {
            with_busy_retry(|| {
                conn.execute(
                    "INSERT OR REPLACE INTO tracked_targets
                        (target_id, channel, identifier, added_at_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.target_id,
                        record.channel.as_str(),
                        record.identifier,
                        record.added_at_ms,
                    ],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }

    /// Removes a target from tracking. Raw history stays untouched.
    pub async fn delete_tracked_target(&self, target_id: &str) -> Result<()> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            with_busy_retry(|| {
                conn.execute(
                    "DELETE FROM tracked_targets WHERE target_id = ?1",
                    params![target_id],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }

    pub async fn list_tracked_targets(&self) -> Result<Vec<TrackedTarget>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT target_id, channel, identifier, added_at_ms
                 FROM tracked_targets
                 ORDER BY added_at_ms ASC",
            )?;

            let rows = stmt.query_and_then(params![], row_to_tracked_target)?;
            rows.collect()
        })
        .await
    }
}
