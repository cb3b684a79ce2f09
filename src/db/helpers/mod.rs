use std::convert::TryFrom;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;
use rusqlite::ErrorCode;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_optional_i64(value: Option<u64>) -> Result<Option<i64>> {
    match value {
        Some(raw) => to_i64(raw).map(Some),
        None => Ok(None),
    }
}

pub fn to_optional_u64(value: Option<i64>, field: &str) -> Result<Option<u64>> {
    match value {
        Some(raw) => to_u64(raw, field).map(Some),
        None => Ok(None),
    }
}

const MAX_BUSY_ATTEMPTS: u32 = 5;

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Run a statement with bounded, jittered retries on lock contention.
/// Constraint violations and other errors surface on the first attempt.
pub fn with_busy_retry<T>(
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < MAX_BUSY_ATTEMPTS => {
                attempt += 1;
                let base = 20u64 << attempt;
                let jitter = rand::thread_rng().gen_range(0..base);
                std::thread::sleep(Duration::from_millis(base + jitter));
            }
            Err(err) => return Err(err),
        }
    }
}
