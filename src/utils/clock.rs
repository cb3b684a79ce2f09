use chrono::Utc;

/// Milliseconds since the Unix epoch. All persisted timestamps use this
/// clock; elapsed-time measurement uses `Instant` instead.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
