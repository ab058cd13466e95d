//! Redis keyspace. Every round key embeds the round id so a full per-round
//! wipe is a bounded DEL, and TTLs reclaim everything even without one.

pub fn score_zset(round_id: i64) -> String {
    format!("round:{round_id}:scores")
}

pub fn score_sum(round_id: i64) -> String {
    format!("round:{round_id}:score_sum")
}

/// Per-user dedup bitmap. The round start time is baked in so a re-started
/// round can never replay grants against a stale bitmap.
pub fn click_bitmap(round_id: i64, user_id: i64, start_at_ms: i64) -> String {
    format!("round:{round_id}:start:{start_at_ms}:user:{user_id}:clicks")
}

pub fn click_stream(round_id: i64) -> String {
    format!("round:{round_id}:clicks")
}

pub fn whitelist(round_id: i64) -> String {
    format!("round:{round_id}:whitelist")
}

pub fn qps(round_id: i64, sec: i64) -> String {
    format!("round:{round_id}:qps:{sec}")
}

pub fn draw_lock(round_id: i64) -> String {
    format!("draw_lock:round:{round_id}")
}

pub fn online_users() -> &'static str {
    "online:users"
}

pub fn online_user_ids() -> &'static str {
    "online:user:ids"
}

pub fn session(user_id: i64) -> String {
    format!("session:uid:{user_id}")
}

pub fn score_member(user_id: i64) -> String {
    format!("u:{user_id}")
}

pub fn parse_score_member(member: &str) -> Option<i64> {
    member.strip_prefix("u:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_round_trip() {
        assert_eq!(parse_score_member(&score_member(42)), Some(42));
        assert_eq!(parse_score_member("x:42"), None);
        assert_eq!(parse_score_member("u:abc"), None);
    }

    #[test]
    fn test_bitmap_key_includes_start() {
        let a = click_bitmap(5, 9, 1_000);
        let b = click_bitmap(5, 9, 2_000);
        assert_ne!(a, b);
    }
}
