use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::error::GameError;
use crate::game::clock::now_ms;
use crate::game::compiler::{build_round_runtime, random_round_seed};
use crate::game::payout::{distribute_pool, lucky_seed};
use crate::game::slice::SliceManifest;
use crate::models::{Round, RoundStatus};

use super::messages::{mask_round_for, round_state_payload, ws_message};
use super::Server;

const DRAW_LOCK_TTL_SECS: i64 = 60;

impl Server {
    /// Admin lock: freeze the whitelist, pull currently-active users into it,
    /// import it into the store, and push every client back to the waiting
    /// screen.
    pub async fn lock_round(&self, round_id: i64) -> Result<(), GameError> {
        self.rounds.set_status(round_id, RoundStatus::Locked).await?;

        let active = self.presence.active_online(now_ms()).await.unwrap_or_default();
        if !active.is_empty() {
            self.rounds.whitelist_add(round_id, &active).await?;
        }
        let members = self.rounds.whitelist_ids(round_id).await?;
        self.store.whitelist_add(round_id, &members).await?;

        self.broadcast_clear_screen(round_id, "locked");
        if let Some(round) = self.rounds.get(round_id).await? {
            self.broadcast_round_state(&round).await;
        }
        Ok(())
    }

    /// Admin start: sample the seed, fix the timeline, compile the runtime
    /// and arm the countdown/running/ready-draw timers.
    pub async fn start_round(
        self: Arc<Self>,
        round_id: i64,
        countdown_sec: i64,
    ) -> Result<i64, GameError> {
        let round = self
            .rounds
            .get(round_id)
            .await?
            .ok_or(GameError::RoundNotFound)?;
        if round.status != RoundStatus::Locked {
            return Err(GameError::RoundNotLocked);
        }

        // A re-run of a wiped round must not inherit stale scores.
        self.store.wipe_round(round_id).await.map_err(GameError::Internal)?;

        let countdown_sec = if countdown_sec <= 0 { 3 } else { countdown_sec };
        let seed = random_round_seed();
        let start_at = now_ms() + countdown_sec * 1000;
        let end_at = start_at + round.duration_sec * 1000;
        self.rounds.begin_countdown(round_id, start_at, end_at, seed).await?;

        let mut updated = round;
        updated.status = RoundStatus::Countdown;
        updated.seed = seed;
        updated.start_at_ms = start_at;
        updated.end_at_ms = end_at;

        let runtime = build_round_runtime(updated.clone(), self.cfg.click_window_ms)
            .map_err(GameError::Internal)?;
        self.game.set_current(Some(runtime));
        self.broadcast_round_state(&updated).await;

        self.arm_lifecycle_timers(round_id, start_at, end_at);
        Ok(start_at)
    }

    /// One-shot transition timers. Each fire writes the durable status
    /// first, then patches memory and broadcasts.
    pub fn arm_lifecycle_timers(self: Arc<Self>, round_id: i64, start_at_ms: i64, end_at_ms: i64) {
        let srv = self.clone();
        tokio::spawn(async move {
            sleep_until_ms(start_at_ms).await;
            srv.apply_timer_transition(round_id, RoundStatus::Running).await;
        });
        tokio::spawn(async move {
            sleep_until_ms(end_at_ms).await;
            self.apply_timer_transition(round_id, RoundStatus::ReadyDraw).await;
        });
    }

    async fn apply_timer_transition(&self, round_id: i64, status: RoundStatus) {
        // The runtime may have been swapped while the timer slept.
        if self.game.current_round_id() != Some(round_id) {
            return;
        }
        if let Err(err) = self.rounds.set_status(round_id, status).await {
            tracing::error!(round_id, status = status.as_str(), %err, "timer status write failed");
            return;
        }
        self.game.patch_status(round_id, status);
        tracing::info!(round_id, status = status.as_str(), "round transition");
        match self.rounds.get(round_id).await {
            Ok(Some(round)) => self.broadcast_round_state(&round).await,
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "round reload after transition failed"),
        }
    }

    /// Settles the round under the distributed single-writer lock.
    pub async fn draw_round(&self, round_id: i64) -> Result<(), GameError> {
        let locked = self
            .store
            .acquire_draw_lock(round_id, DRAW_LOCK_TTL_SECS)
            .await
            .map_err(GameError::Internal)?;
        if !locked {
            return Err(GameError::DrawInProgress);
        }
        let result = self.draw_round_locked(round_id).await;
        if let Err(err) = self.store.release_draw_lock(round_id).await {
            tracing::warn!(round_id, %err, "draw lock release failed");
        }
        result
    }

    async fn draw_round_locked(&self, round_id: i64) -> Result<(), GameError> {
        let round = self
            .rounds
            .get(round_id)
            .await?
            .ok_or(GameError::RoundNotFound)?;
        // A settled round is a no-op, not an error: the draw is idempotent
        // from the admin's point of view.
        if matches!(round.status, RoundStatus::PendingConfirm | RoundStatus::Finished) {
            return Ok(());
        }
        if !matches!(round.status, RoundStatus::ReadyDraw | RoundStatus::Running) {
            return Err(GameError::RoundNotReady);
        }

        self.rounds.set_status(round_id, RoundStatus::Drawing).await?;
        self.game.patch_status(round_id, RoundStatus::Drawing);
        let mut drawing = round.clone();
        drawing.status = RoundStatus::Drawing;
        self.broadcast_round_state(&drawing).await;

        let scores: Vec<(i64, i64)> = self
            .store
            .all_scores(round_id)
            .await
            .map_err(GameError::Internal)?
            .into_iter()
            .map(|(uid, score)| (uid, score.max(0)))
            .collect();

        let seed = lucky_seed(round.seed, now_ns(), scores.iter().filter(|&&(_, s)| s > 0).count());
        let allocs = distribute_pool(
            round.total_pool,
            round.lucky_ratio,
            round.base_ratio,
            &scores,
            seed,
        );

        let batch_id = match self.awards.persist_batch(round_id, round.total_pool, &allocs).await {
            Ok(id) => id,
            Err(err) => {
                // Roll the status back so the draw can be retried.
                let _ = self.rounds.set_status(round_id, RoundStatus::ReadyDraw).await;
                self.game.patch_status(round_id, RoundStatus::ReadyDraw);
                return Err(GameError::Internal(err));
            }
        };
        tracing::info!(round_id, batch_id, winners = allocs.len(), "award batch persisted");

        for a in &allocs {
            let msg = ws_message(
                "round_drawn",
                json!({
                    "round_id": round_id,
                    "score": a.score,
                    "amount": a.amount,
                    "base_amount": a.base_amount,
                    "lucky_amount": a.lucky_amount,
                }),
            );
            self.hub.send_to_user(a.user_id, &msg);
        }

        self.game.patch_status(round_id, RoundStatus::PendingConfirm);
        if let Some(round) = self.rounds.get(round_id).await? {
            self.broadcast_round_state(&round).await;
        }
        Ok(())
    }

    /// Credits wallets for a persisted batch; safe to repeat.
    pub async fn confirm_award(&self, batch_id: i64) -> Result<(), GameError> {
        let round_id = self.awards.confirm(batch_id).await.map_err(GameError::Internal)?;
        self.game.patch_status(round_id, RoundStatus::Finished);
        if let Some(round) = self.rounds.get(round_id).await? {
            self.broadcast_round_state(&round).await;
        }
        Ok(())
    }

    /// Admin wipe: back to Waiting, forget the runtime, drop the round's
    /// score keys and clear every screen.
    pub async fn clear_round(&self, round_id: i64) -> Result<(), GameError> {
        self.rounds.set_status(round_id, RoundStatus::Waiting).await?;
        if self.game.current_round_id() == Some(round_id) {
            self.game.set_current(None);
        }
        self.store.wipe_round(round_id).await.map_err(GameError::Internal)?;
        self.broadcast_clear_screen(round_id, "manual");
        Ok(())
    }

    /// Restart recovery: the durable status is the source of truth and the
    /// timers are re-armed from the wall clock.
    pub async fn recover_current_round(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(round) = self.rounds.latest_active().await? else {
            return Ok(());
        };
        let round_id = round.id;
        tracing::info!(round_id, status = round.status.as_str(), "recovering round");

        let mut adopted = round;
        // A crash mid-draw leaves Drawing behind; the lock TTL has lapsed,
        // so fall back to ReadyDraw and let the admin retry.
        if adopted.status == RoundStatus::Drawing {
            self.rounds.set_status(round_id, RoundStatus::ReadyDraw).await?;
            adopted.status = RoundStatus::ReadyDraw;
        }
        let now = now_ms();
        if matches!(adopted.status, RoundStatus::Countdown | RoundStatus::Running) {
            if now >= adopted.end_at_ms {
                self.rounds.set_status(round_id, RoundStatus::ReadyDraw).await?;
                adopted.status = RoundStatus::ReadyDraw;
            } else if adopted.status == RoundStatus::Countdown && now >= adopted.start_at_ms {
                self.rounds.set_status(round_id, RoundStatus::Running).await?;
                adopted.status = RoundStatus::Running;
            }
        }

        let runtime = build_round_runtime(adopted.clone(), self.cfg.click_window_ms)?;
        self.game.set_current(Some(runtime));
        if matches!(adopted.status, RoundStatus::Countdown | RoundStatus::Running) {
            self.arm_lifecycle_timers(round_id, adopted.start_at_ms, adopted.end_at_ms);
        }
        Ok(())
    }

    pub fn broadcast_clear_screen(&self, round_id: i64, reason: &str) {
        let msg = ws_message("clear_screen", json!({ "round_id": round_id, "reason": reason }));
        self.hub.broadcast(&msg);
    }

    /// Pushes the round state to every connected client. Waiting/Locked look
    /// identical to everyone and go out as one broadcast; in-play states are
    /// personalized (masking + per-user slice payloads).
    pub async fn broadcast_round_state(&self, round: &Round) {
        let current = self.game.current();
        let (manifests, salt): (Option<Vec<SliceManifest>>, String) = match &current {
            Some(rt) if rt.round.id == round.id => (
                Some(rt.slices.iter().map(|s| s.manifest.clone()).collect()),
                rt.reveal_salt.clone(),
            ),
            _ => (None, String::new()),
        };
        let online_count = self
            .presence
            .active_online(now_ms())
            .await
            .map(|ids| ids.len())
            .unwrap_or(0);
        let whitelist_count = self.store.whitelist_count(round.id).await.unwrap_or(0);

        let user_ids = self.hub.user_ids();
        if user_ids.is_empty()
            || matches!(round.status, RoundStatus::Waiting | RoundStatus::Locked)
        {
            let payload = round_state_payload(
                round,
                manifests.as_deref(),
                &salt,
                Some(true),
                online_count,
                whitelist_count,
                0,
            );
            self.hub.broadcast(&ws_message("round_state", payload));
            return;
        }

        let eligibility = self
            .store
            .whitelist_members(round.id, &user_ids)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(%err, "bulk whitelist check failed");
                vec![false; user_ids.len()]
            });

        for (uid, eligible) in user_ids.into_iter().zip(eligibility) {
            let masked = mask_round_for(round, eligible);
            let payload = round_state_payload(
                &masked,
                manifests.as_deref(),
                &salt,
                Some(eligible),
                online_count,
                whitelist_count,
                uid,
            );
            self.hub.send_to_user(uid, &ws_message("round_state", payload));
        }
    }
}

async fn sleep_until_ms(deadline_ms: i64) {
    let wait = deadline_ms - now_ms();
    if wait > 0 {
        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
