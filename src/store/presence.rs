use anyhow::{Context, Result};
use dashmap::DashMap;
use redis::aio::ConnectionManager;

use super::keys;

const TOUCH_COALESCE_MS: i64 = 2_000;
const ONLINE_STALE_MS: i64 = 20_000;

/// Lazy liveness map. Touches for the same user inside the coalescing window
/// never reach the store; stale entries are reaped in one batched pipeline
/// whenever the active set is read.
pub struct Presence {
    con: ConnectionManager,
    last_touch: DashMap<i64, i64>,
}

impl Presence {
    pub fn new(con: ConnectionManager) -> Self {
        Self {
            con,
            last_touch: DashMap::new(),
        }
    }

    pub async fn mark_online(&self, user_id: i64, now_ms: i64) {
        if user_id <= 0 || !note_touch(&self.last_touch, user_id, now_ms) {
            return;
        }
        let mut con = self.con.clone();
        let res = redis::pipe()
            .cmd("HSET")
            .arg(keys::online_users())
            .arg(user_id)
            .arg(now_ms)
            .ignore()
            .cmd("SADD")
            .arg(keys::online_user_ids())
            .arg(user_id)
            .ignore()
            .query_async::<_, ()>(&mut con)
            .await;
        if let Err(err) = res {
            tracing::warn!(user_id, %err, "presence touch failed");
        }
    }

    /// Users seen within the staleness window; expired entries are removed
    /// from both online keys as a side effect.
    pub async fn active_online(&self, now_ms: i64) -> Result<Vec<i64>> {
        let mut con = self.con.clone();
        let entries: Vec<(i64, i64)> = redis::cmd("HGETALL")
            .arg(keys::online_users())
            .query_async::<_, std::collections::HashMap<String, String>>(&mut con)
            .await
            .context("HGETALL online failed")?
            .into_iter()
            .filter_map(|(id, ts)| Some((id.parse().ok()?, ts.parse().ok()?)))
            .collect();

        let (active, expired) = partition_active(&entries, now_ms);
        if !expired.is_empty() {
            let mut pipe = redis::pipe();
            for uid in &expired {
                pipe.cmd("SREM").arg(keys::online_user_ids()).arg(uid).ignore();
                pipe.cmd("HDEL").arg(keys::online_users()).arg(uid).ignore();
            }
            if let Err(err) = pipe.query_async::<_, ()>(&mut con).await {
                tracing::warn!(%err, "presence reap failed");
            }
        }
        Ok(active)
    }
}

fn note_touch(map: &DashMap<i64, i64>, user_id: i64, now_ms: i64) -> bool {
    if let Some(last) = map.get(&user_id) {
        if now_ms - *last < TOUCH_COALESCE_MS {
            return false;
        }
    }
    map.insert(user_id, now_ms);
    true
}

fn partition_active(entries: &[(i64, i64)], now_ms: i64) -> (Vec<i64>, Vec<i64>) {
    let mut active = Vec::with_capacity(entries.len());
    let mut expired = Vec::new();
    for &(uid, ts) in entries {
        if ts > 0 && now_ms - ts <= ONLINE_STALE_MS {
            active.push(uid);
        } else {
            expired.push(uid);
        }
    }
    (active, expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_coalescing() {
        let map = DashMap::new();
        assert!(note_touch(&map, 1, 10_000));
        assert!(!note_touch(&map, 1, 11_999));
        assert!(note_touch(&map, 1, 12_000));
        // distinct users do not coalesce against each other
        assert!(note_touch(&map, 2, 12_001));
    }

    #[test]
    fn test_partition_by_staleness() {
        let now = 100_000;
        let entries = vec![(1, 100_000), (2, 80_000), (3, 79_999), (4, 0)];
        let (active, expired) = partition_active(&entries, now);
        assert_eq!(active, vec![1, 2]);
        assert_eq!(expired, vec![3, 4]);
    }
}
