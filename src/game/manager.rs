use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::GameError;
use crate::models::RoundStatus;
use crate::store::score::{round_key_ttl_secs, ScoreStore};

use super::cache::RuntimeCache;
use super::compiler::RoundRuntime;
use super::slice::{build_with_seeds, user_seed, user_visual_seed, SliceRuntime};

#[derive(Debug, Clone, Copy)]
pub struct ClickResult {
    pub delta: i64,
    pub total: i64,
    pub bomb: bool,
}

/// Owns the single current round runtime and the hot click path.
///
/// Readers clone the top-level runtime (slices are Arc-shared), so the write
/// lock is only ever held for a pointer swap or a status patch.
pub struct GameManager {
    current: RwLock<Option<RoundRuntime>>,
    cache: RuntimeCache,
    store: ScoreStore,
    min_speed_mult: f64,
    time_skew_ms: i64,
    late_grace_ms: i64,
}

impl GameManager {
    pub fn new(
        store: ScoreStore,
        min_speed_mult: f64,
        time_skew_ms: i64,
        late_grace_ms: i64,
        cache_users: usize,
        cache_slices: usize,
    ) -> Self {
        Self {
            current: RwLock::new(None),
            cache: RuntimeCache::new(cache_users, cache_slices),
            store,
            min_speed_mult,
            time_skew_ms,
            late_grace_ms,
        }
    }

    pub fn set_current(&self, runtime: Option<RoundRuntime>) {
        *self.current.write() = runtime;
        self.cache.reset();
    }

    pub fn current(&self) -> Option<RoundRuntime> {
        self.current.read().clone()
    }

    pub fn current_round_id(&self) -> Option<i64> {
        self.current.read().as_ref().map(|rt| rt.round.id)
    }

    /// Patches the in-memory status after the durable write; a stale round
    /// id (runtime already swapped) is a no-op.
    pub fn patch_status(&self, round_id: i64, status: RoundStatus) -> bool {
        let mut guard = self.current.write();
        match guard.as_mut() {
            Some(rt) if rt.round.id == round_id => {
                rt.round.status = status;
                true
            }
            _ => false,
        }
    }

    /// The user-specific view of one slice, memoized.
    pub fn slice_runtime(&self, rt: &RoundRuntime, user_id: i64, slice_id: usize) -> Arc<SliceRuntime> {
        if let Some(cached) = self.cache.get(rt.round.id, &rt.reveal_salt, user_id, slice_id) {
            return cached;
        }
        let manifest = &rt.slices[slice_id].manifest;
        let outcome = user_seed(manifest.seed, user_id);
        let visual = user_visual_seed(manifest.seed, user_id, &rt.reveal_salt);
        let runtime = Arc::new(build_with_seeds(manifest, outcome, visual));
        self.cache
            .put(rt.round.id, &rt.reveal_salt, user_id, slice_id, runtime.clone());
        runtime
    }

    /// Validates and settles one click. Precondition order: current round,
    /// status, drop id, slice bounds, time window; only then does the atomic
    /// store script run.
    pub async fn validate_click(
        &self,
        user_id: i64,
        round_id: i64,
        drop_id: i64,
        now_ms: i64,
    ) -> Result<ClickResult, GameError> {
        let rt = match self.current() {
            Some(rt) if rt.round.id == round_id => rt,
            _ => return Err(GameError::RoundNotRunning),
        };
        if rt.round.status != RoundStatus::Running {
            return Err(GameError::RoundNotInRunningState);
        }
        if drop_id < 0 {
            return Err(GameError::InvalidDrop);
        }
        let drops_per_slice = rt.round.drops_per_slice;
        let slice_id = (drop_id / drops_per_slice) as usize;
        let idx = (drop_id % drops_per_slice) as usize;
        if slice_id >= rt.slices.len() {
            return Err(GameError::InvalidSlice);
        }
        if idx >= rt.slices[slice_id].manifest.drop_count {
            return Err(GameError::InvalidDropIndex);
        }

        let slice = self.slice_runtime(&rt, user_id, slice_id);
        let drop_start = slice.manifest.start_at_ms + slice.offsets_ms[idx];
        if !window_open(
            drop_start,
            slice.manifest.window_ms,
            now_ms,
            self.time_skew_ms,
            self.late_grace_ms,
        ) {
            return Err(GameError::OutOfWindow);
        }

        let (delta, bomb) = classify_click(
            &slice,
            idx,
            now_ms,
            drop_start,
            rt.round.bomb_penalty,
            self.min_speed_mult,
        );

        let ttl = round_key_ttl_secs(rt.round.end_at_ms, now_ms);
        let apply = self
            .store
            .apply_click(round_id, user_id, rt.round.start_at_ms, drop_id, delta, ttl)
            .await?;
        if apply.already {
            return Err(GameError::AlreadyClicked);
        }
        Ok(ClickResult {
            delta: apply.granted,
            total: apply.total,
            bomb,
        })
    }
}

/// Window check. Both bounds are inclusive; `time_skew` widens each side and
/// `late_grace` only the tail.
pub fn window_open(drop_start: i64, window_ms: i64, now_ms: i64, time_skew_ms: i64, late_grace_ms: i64) -> bool {
    now_ms + time_skew_ms >= drop_start && now_ms <= drop_start + window_ms + time_skew_ms + late_grace_ms
}

/// Score for a tap at `now_ms`: bombs cost the penalty, empties are free,
/// scoring drops decay linearly down to `min_speed_mult` and never round
/// below one point.
pub fn classify_click(
    slice: &SliceRuntime,
    idx: usize,
    now_ms: i64,
    drop_start: i64,
    bomb_penalty: i64,
    min_speed_mult: f64,
) -> (i64, bool) {
    let is_bomb = slice.is_bomb[idx];
    if is_bomb {
        return (-bomb_penalty, true);
    }
    if slice.is_empty[idx] {
        return (0, false);
    }
    let elapsed = (now_ms - drop_start) as f64 / slice.manifest.window_ms as f64;
    let speed_mult = (1.0 - elapsed).clamp(min_speed_mult, 1.0);
    let delta = (slice.base_scores[idx] as f64 * speed_mult).round() as i64;
    (delta.max(1), false)
}
