use anyhow::Result;
use rusqlite::{params, Row};

use crate::adapters::Channel;
use crate::analysis::TrackerState;
use crate::db::{
    connection::Database,
    helpers::with_busy_retry,
    models::AnalysisWindow,
};

fn row_to_analysis_window(row: &Row) -> Result<AnalysisWindow> {
    let channel: String = row.get("channel")?;
    let derived_state: String = row.get("derived_state")?;
    let sample_count: i64 = row.get("sample_count")?;

    Ok(AnalysisWindow {
        id: row.get("id")?,
        target_id: row.get("target_id")?,
        channel: Channel::parse(&channel)?,
        start_ms: row.get("start_ms")?,
        end_ms: row.get("end_ms")?,
        sample_count: u32::try_from(sample_count).unwrap_or(0),
        noise_score: row.get("noise_score")?,
        responsiveness_score: row.get("responsiveness_score")?,
        confidence_score: row.get("confidence_score")?,
        derived_state: TrackerState::parse(&derived_state)?,
    })
}

impl Database {
    pub async fn append_analysis_window(&self, window: &AnalysisWindow) -> Result<()> {
        let record = window.clone();
        self.execute(move |conn| {
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO analysis_windows (
                        target_id,
                        channel,
                        start_ms,
                        end_ms,
                        sample_count,
                        noise_score,
                        responsiveness_score,
                        confidence_score,
                        derived_state
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        record.target_id,
                        record.channel.as_str(),
                        record.start_ms,
                        record.end_ms,
                        record.sample_count,
                        record.noise_score,
                        record.responsiveness_score,
                        record.confidence_score,
                        record.derived_state.as_str(),
                    ],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }

    /// Newest analysis row for a target by window end. The newest row wins
    /// for live display even when historical ranges were recomputed.
    pub async fn get_latest_analysis(&self, target_id: &str) -> Result<Option<AnalysisWindow>> {
        let target_id = target_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_id, channel, start_ms, end_ms, sample_count,
                        noise_score, responsiveness_score, confidence_score, derived_state
                 FROM analysis_windows
                 WHERE target_id = ?1
                 ORDER BY end_ms DESC, id DESC
                 LIMIT 1",
            )?;

            let mut rows = stmt.query_and_then(params![target_id], row_to_analysis_window)?;
            rows.next().transpose()
        })
        .await
    }
}
