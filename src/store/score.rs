use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

use super::keys;
use super::script::{ClickApply, CLICK_SCRIPT};

/// Round-keyed score state: sorted set of cumulative scores, granted-delta
/// sum counter, per-user dedup bitmaps, whitelist set, QPS buckets and the
/// optional click stream. All writes that settle a click go through the
/// atomic script.
#[derive(Clone)]
pub struct ScoreStore {
    con: ConnectionManager,
}

impl ScoreStore {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    pub async fn apply_click(
        &self,
        round_id: i64,
        user_id: i64,
        start_at_ms: i64,
        drop_id: i64,
        delta: i64,
        ttl_secs: i64,
    ) -> Result<ClickApply> {
        let mut con = self.con.clone();
        let reply: Vec<i64> = CLICK_SCRIPT
            .key(keys::click_bitmap(round_id, user_id, start_at_ms))
            .key(keys::score_zset(round_id))
            .key(keys::score_sum(round_id))
            .arg(drop_id)
            .arg(delta)
            .arg(ttl_secs)
            .arg(keys::score_member(user_id))
            .invoke_async(&mut con)
            .await
            .context("click script failed")?;
        ClickApply::from_reply(&reply).context("unexpected click script reply")
    }

    pub async fn user_score(&self, round_id: i64, user_id: i64) -> Result<i64> {
        let mut con = self.con.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(keys::score_zset(round_id))
            .arg(keys::score_member(user_id))
            .query_async(&mut con)
            .await
            .context("ZSCORE failed")?;
        Ok(score.unwrap_or(0.0) as i64)
    }

    /// Every participant with their cumulative score, unordered.
    pub async fn all_scores(&self, round_id: i64) -> Result<Vec<(i64, i64)>> {
        let mut con = self.con.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(keys::score_zset(round_id))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut con)
            .await
            .context("ZRANGE failed")?;
        Ok(parse_scored_members(raw))
    }

    pub async fn leaderboard(&self, round_id: i64, limit: i64) -> Result<Vec<(i64, i64)>> {
        let mut con = self.con.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(keys::score_zset(round_id))
            .arg(0)
            .arg(limit - 1)
            .arg("WITHSCORES")
            .query_async(&mut con)
            .await
            .context("ZREVRANGE failed")?;
        Ok(parse_scored_members(raw))
    }

    pub async fn participant_count(&self, round_id: i64) -> Result<i64> {
        let mut con = self.con.clone();
        redis::cmd("ZCARD")
            .arg(keys::score_zset(round_id))
            .query_async(&mut con)
            .await
            .context("ZCARD failed")
    }

    pub async fn score_sum(&self, round_id: i64) -> Result<Option<i64>> {
        let mut con = self.con.clone();
        redis::cmd("GET")
            .arg(keys::score_sum(round_id))
            .query_async(&mut con)
            .await
            .context("GET score_sum failed")
    }

    /// Rebuilds the sum counter from the zset when the key has lapsed.
    pub async fn rebuild_score_sum(&self, round_id: i64, ttl_secs: i64) -> Result<i64> {
        let total: i64 = self.all_scores(round_id).await?.iter().map(|&(_, s)| s).sum();
        let mut con = self.con.clone();
        redis::cmd("SET")
            .arg(keys::score_sum(round_id))
            .arg(total)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async::<_, ()>(&mut con)
            .await
            .context("SET score_sum failed")?;
        Ok(total)
    }

    /// Full per-round wipe before a re-init.
    pub async fn wipe_round(&self, round_id: i64) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("DEL")
            .arg(keys::score_zset(round_id))
            .arg(keys::score_sum(round_id))
            .arg(keys::click_stream(round_id))
            .query_async::<_, ()>(&mut con)
            .await
            .context("DEL round keys failed")?;
        Ok(())
    }

    pub async fn whitelist_add(&self, round_id: i64, user_ids: &[i64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("SADD");
        cmd.arg(keys::whitelist(round_id));
        for uid in user_ids {
            cmd.arg(uid);
        }
        cmd.query_async::<_, ()>(&mut con)
            .await
            .context("SADD whitelist failed")?;
        Ok(())
    }

    pub async fn is_whitelisted(&self, round_id: i64, user_id: i64) -> Result<bool> {
        let mut con = self.con.clone();
        redis::cmd("SISMEMBER")
            .arg(keys::whitelist(round_id))
            .arg(user_id)
            .query_async(&mut con)
            .await
            .context("SISMEMBER failed")
    }

    /// Bulk membership check used by state broadcasts (SMISMEMBER).
    pub async fn whitelist_members(&self, round_id: i64, user_ids: &[i64]) -> Result<Vec<bool>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("SMISMEMBER");
        cmd.arg(keys::whitelist(round_id));
        for uid in user_ids {
            cmd.arg(uid);
        }
        let flags: Vec<i64> = cmd
            .query_async(&mut con)
            .await
            .context("SMISMEMBER failed")?;
        Ok(flags.into_iter().map(|f| f == 1).collect())
    }

    pub async fn whitelist_count(&self, round_id: i64) -> Result<i64> {
        let mut con = self.con.clone();
        redis::cmd("SCARD")
            .arg(keys::whitelist(round_id))
            .query_async(&mut con)
            .await
            .context("SCARD failed")
    }

    /// Single-writer draw lock; the TTL bounds the damage of a crashed draw.
    pub async fn acquire_draw_lock(&self, round_id: i64, ttl_secs: i64) -> Result<bool> {
        let mut con = self.con.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(keys::draw_lock(round_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await
            .context("SET draw lock failed")?;
        Ok(reply.is_some())
    }

    pub async fn release_draw_lock(&self, round_id: i64) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("DEL")
            .arg(keys::draw_lock(round_id))
            .query_async::<_, ()>(&mut con)
            .await
            .context("DEL draw lock failed")?;
        Ok(())
    }

    /// Optional audit stream entry; capped by the round TTL.
    pub async fn append_click_event(
        &self,
        round_id: i64,
        user_id: i64,
        drop_id: i64,
        delta: i64,
        bomb: bool,
        ts_ms: i64,
        ttl_secs: i64,
    ) -> Result<()> {
        let key = keys::click_stream(round_id);
        let mut con = self.con.clone();
        redis::pipe()
            .cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg("uid")
            .arg(user_id)
            .arg("drop_id")
            .arg(drop_id)
            .arg("delta")
            .arg(delta)
            .arg("bomb")
            .arg(bomb as i64)
            .arg("ts")
            .arg(ts_ms)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut con)
            .await
            .context("XADD click event failed")?;
        Ok(())
    }

    /// Drains per-round tap counters into per-second buckets.
    pub async fn flush_qps(&self, entries: &[(i64, i64)], sec: i64) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        let mut pipe = redis::pipe();
        for &(round_id, n) in entries {
            let key = keys::qps(round_id, sec);
            pipe.cmd("INCRBY").arg(&key).arg(n).ignore();
            pipe.cmd("EXPIRE").arg(&key).arg(10).ignore();
        }
        pipe.query_async::<_, ()>(&mut con)
            .await
            .context("QPS flush failed")?;
        Ok(())
    }

    /// 5-second average and last-second tap rate for a round.
    pub async fn qps_window(&self, round_id: i64, now_ms: i64) -> Result<(i64, i64)> {
        let sec = now_ms / 1000;
        let mut con = self.con.clone();
        let mut pipe = redis::pipe();
        for i in 0..5 {
            pipe.cmd("GET").arg(keys::qps(round_id, sec - i));
        }
        let vals: Vec<Option<i64>> = pipe
            .query_async(&mut con)
            .await
            .context("QPS read failed")?;
        let total: i64 = vals.iter().map(|v| v.unwrap_or(0)).sum();
        let last = vals.first().and_then(|v| *v).unwrap_or(0);
        Ok((total / 5, last))
    }
}

fn parse_scored_members(raw: Vec<(String, f64)>) -> Vec<(i64, i64)> {
    raw.into_iter()
        .filter_map(|(member, score)| keys::parse_score_member(&member).map(|uid| (uid, score as i64)))
        .collect()
}

/// TTL for a round's keys: two hours past the round end, with a floor that
/// keeps nearly-expired rounds readable while settlement runs.
pub fn round_key_ttl_secs(end_at_ms: i64, now_ms: i64) -> i64 {
    const TWO_HOURS: i64 = 2 * 3600;
    if end_at_ms <= 0 {
        return TWO_HOURS;
    }
    let ttl = (end_at_ms - now_ms) / 1000 + TWO_HOURS;
    if ttl < 60 {
        TWO_HOURS
    } else {
        ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_key_ttl() {
        assert_eq!(round_key_ttl_secs(0, 1_000_000), 7_200);
        // round ends in 60s: 60 + 7200
        assert_eq!(round_key_ttl_secs(1_060_000, 1_000_000), 7_260);
        // long-expired round falls back to the default
        assert_eq!(round_key_ttl_secs(1_000_000, 1_000_000 + 3 * 3_600 * 1_000), 7_200);
    }

    #[test]
    fn test_parse_scored_members_skips_foreign() {
        let parsed = parse_scored_members(vec![
            ("u:3".into(), 12.0),
            ("junk".into(), 9.0),
            ("u:11".into(), 0.0),
        ]);
        assert_eq!(parsed, vec![(3, 12), (11, 0)]);
    }
}
