use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Picks the clock a click is judged against. A client timestamp within
/// `max(3000, skew + grace)` ms of the server clock is trusted, which absorbs
/// small drift without letting a replayed timestamp reopen a window.
pub fn effective_now(client_ts: i64, server_now: i64, time_skew_ms: i64, click_grace_ms: i64) -> i64 {
    if client_ts <= 0 {
        return server_now;
    }
    let max_skew = (time_skew_ms + click_grace_ms).max(3000);
    if (client_ts - server_now).abs() <= max_skew {
        client_ts
    } else {
        server_now
    }
}
