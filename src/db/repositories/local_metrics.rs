use anyhow::Result;
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{to_i64, to_optional_i64, with_busy_retry},
    models::LocalNetworkSample,
};

impl Database {
    pub async fn append_local_sample(&self, sample: &LocalNetworkSample) -> Result<()> {
        let record = sample.clone();
        self.execute(move |conn| {
            let rtt_ms = to_optional_i64(record.rtt_ms)?;
            let variance_ms = to_i64(record.variance_ms)?;
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO local_network_metrics (
                        timestamp_ms,
                        rtt_ms,
                        timeout,
                        variance_ms,
                        packet_loss_rate,
                        reference_target
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.timestamp_ms,
                        rtt_ms,
                        record.timeout,
                        variance_ms,
                        record.packet_loss_rate,
                        record.reference_target,
                    ],
                )
                .map(|_| ())
            })?;
            Ok(())
        })
        .await
    }
}
