use once_cell::sync::Lazy;
use redis::Script;

/// Atomic click settlement.
///
/// KEYS: bitmap, score zset, sum counter. ARGV: bit offset, delta, ttl
/// seconds, zset member. Returns `{already, total, granted}`.
///
/// The bitmap bit is set first: a repeat click bails before any score key is
/// touched. A negative running total is clamped to zero and the granted
/// delta rewritten to the realized part, so the sum counter only ever
/// accumulates deltas that actually landed.
pub static CLICK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local bitKey = KEYS[1]
local scoreKey = KEYS[2]
local sumKey = KEYS[3]
local bitOffset = tonumber(ARGV[1])
local delta = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local member = ARGV[4]

local old = redis.call('SETBIT', bitKey, bitOffset, 1)
if old == 1 then
  return {1, 0, 0}
end

local total = redis.call('ZINCRBY', scoreKey, delta, member)
total = tonumber(total)
if total < 0 then
  redis.call('ZADD', scoreKey, 0, member)
  delta = delta - total
  total = 0
end

if delta ~= 0 then
  redis.call('INCRBY', sumKey, delta)
end

if ttl and ttl > 0 then
  redis.call('EXPIRE', bitKey, ttl)
  redis.call('EXPIRE', scoreKey, ttl)
  if delta ~= 0 then
    redis.call('EXPIRE', sumKey, ttl)
  end
end

return {0, total, delta}
"#,
    )
});

/// Parsed script reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickApply {
    pub already: bool,
    pub total: i64,
    pub granted: i64,
}

impl ClickApply {
    pub fn from_reply(reply: &[i64]) -> Option<ClickApply> {
        if reply.len() < 3 {
            return None;
        }
        Some(ClickApply {
            already: reply[0] == 1,
            total: reply[1],
            granted: reply[2],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// In-memory model of the script, used to pin down the settlement
    /// semantics without a live store.
    #[derive(Default)]
    struct ScriptModel {
        bits: HashSet<(String, i64)>,
        scores: HashMap<(String, String), i64>,
        sums: HashMap<String, i64>,
    }

    impl ScriptModel {
        fn apply(&mut self, bit_key: &str, score_key: &str, sum_key: &str, bit: i64, mut delta: i64, member: &str) -> ClickApply {
            if !self.bits.insert((bit_key.to_string(), bit)) {
                return ClickApply { already: true, total: 0, granted: 0 };
            }
            let entry = self.scores.entry((score_key.to_string(), member.to_string())).or_insert(0);
            *entry += delta;
            let mut total = *entry;
            if total < 0 {
                *entry = 0;
                delta -= total;
                total = 0;
            }
            if delta != 0 {
                *self.sums.entry(sum_key.to_string()).or_insert(0) += delta;
            }
            ClickApply { already: false, total, granted: delta }
        }
    }

    #[test]
    fn test_duplicate_rejected_before_score_touch() {
        let mut m = ScriptModel::default();
        let first = m.apply("b", "s", "sum", 3, 12, "u:1");
        assert_eq!(first, ClickApply { already: false, total: 12, granted: 12 });
        let second = m.apply("b", "s", "sum", 3, 12, "u:1");
        assert!(second.already);
        assert_eq!(m.scores[&("s".into(), "u:1".into())], 12);
        assert_eq!(m.sums["sum"], 12);
    }

    #[test]
    fn test_bomb_clamp_rewrites_granted_delta() {
        let mut m = ScriptModel::default();
        m.apply("b", "s", "sum", 0, 30, "u:1");
        let bomb = m.apply("b", "s", "sum", 1, -50, "u:1");
        assert_eq!(bomb, ClickApply { already: false, total: 0, granted: -30 });
        // the sum tracks granted deltas only: 30 - 30 = 0
        assert_eq!(m.sums["sum"], 0);
    }

    #[test]
    fn test_zero_delta_skips_sum() {
        let mut m = ScriptModel::default();
        let empty = m.apply("b", "s", "sum", 0, 0, "u:1");
        assert_eq!(empty.granted, 0);
        assert!(!m.sums.contains_key("sum"));
    }

    #[test]
    fn test_sum_equals_granted_deltas_across_users() {
        let mut m = ScriptModel::default();
        m.apply("b1", "s", "sum", 0, 10, "u:1");
        m.apply("b2", "s", "sum", 0, 5, "u:2");
        m.apply("b1", "s", "sum", 1, -50, "u:1"); // clamps to -10
        m.apply("b2", "s", "sum", 1, 7, "u:2");
        assert_eq!(m.sums["sum"], 10 + 5 - 10 + 7);
        assert_eq!(m.scores[&("s".into(), "u:1".into())], 0);
        assert_eq!(m.scores[&("s".into(), "u:2".into())], 12);
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(
            ClickApply::from_reply(&[0, 42, 7]),
            Some(ClickApply { already: false, total: 42, granted: 7 })
        );
        assert_eq!(
            ClickApply::from_reply(&[1, 0, 0]),
            Some(ClickApply { already: true, total: 0, granted: 0 })
        );
        assert_eq!(ClickApply::from_reply(&[0, 1]), None);
    }
}
