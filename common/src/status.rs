use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::StatusPayload;

/// True while the last contact is younger than `timeout_ms`.
pub fn is_online(heartbeat_ms: Option<i64>, now_ms: i64, timeout_ms: u64) -> bool {
    match heartbeat_ms {
        Some(heartbeat) => (now_ms as i128 - heartbeat as i128) < timeout_ms as i128,
        None => false,
    }
}

pub fn derive_status(
    led_state: &str,
    heartbeat_ms: Option<i64>,
    now_ms: i64,
    timeout_ms: u64,
) -> StatusPayload {
    StatusPayload {
        online: is_online(heartbeat_ms, now_ms, timeout_ms),
        led_state: led_state.to_string(),
        last_seen: heartbeat_ms.and_then(iso_timestamp),
        server_time: iso_timestamp(now_ms).unwrap_or_default(),
    }
}

/// Epoch milliseconds as an ISO-8601 UTC string with millisecond precision.
pub fn iso_timestamp(epoch_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
}
