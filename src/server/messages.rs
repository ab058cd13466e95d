use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use warp::ws::Message;

use crate::game::clock::now_ms;
use crate::game::slice::{
    build_with_seed, build_with_seeds, seed_commit, user_seed, user_visual_seed, SliceManifest,
};
use crate::models::{Round, RoundStatus};

/// Every server frame is `{type, data}`.
pub fn ws_message(msg_type: &str, data: Value) -> Message {
    Message::text(
        serde_json::to_string(&json!({ "type": msg_type, "data": data }))
            .expect("ws payload serializes"),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct ClickRequest {
    #[serde(default)]
    pub round_id: i64,
    #[serde(default)]
    pub drop_id: i64,
    #[serde(default)]
    pub client_ts: i64,
    #[serde(default)]
    pub sign: String,
}

/// Compact channel click: `{r, d, t, s, seq}`.
#[derive(Debug, Default, Deserialize)]
pub struct CompactClick {
    #[serde(default)]
    pub r: i64,
    #[serde(default)]
    pub d: i64,
    #[serde(default)]
    pub t: i64,
    #[serde(default)]
    pub s: String,
    #[serde(default)]
    pub seq: i64,
}

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub data: Value,
}

/// Per-slice payload sent to an eligible user: the manifest, the user's
/// visual offsets and outcome types, and the commitment to the outcome seed.
/// Drop types: 0 normal, 1 bomb, 2 big, 3 empty.
#[derive(Debug, Serialize)]
pub struct SlicePayload {
    pub slice_id: usize,
    pub start_at: i64,
    pub duration_ms: i64,
    pub drop_count: usize,
    pub bomb_count: usize,
    pub big_count: usize,
    pub empty_count: usize,
    pub big_multiplier: f64,
    pub window_ms: i64,
    pub score_total: i64,
    pub offsets_ms: Vec<i64>,
    pub drop_types: Vec<u8>,
    pub seed_commit: String,
}

pub fn build_slice_payload(manifest: &SliceManifest, reveal_salt: &str, user_id: i64) -> SlicePayload {
    let outcome_seed = user_seed(manifest.seed, user_id);
    let outcome = build_with_seed(manifest, outcome_seed);
    let visual_seed = user_visual_seed(manifest.seed, user_id, reveal_salt);
    let viewed = build_with_seeds(manifest, outcome_seed, visual_seed);

    let drop_types = (0..manifest.drop_count)
        .map(|i| {
            if outcome.is_bomb[i] {
                1
            } else if outcome.is_empty[i] {
                3
            } else if outcome.is_big[i] {
                2
            } else {
                0
            }
        })
        .collect();

    SlicePayload {
        slice_id: manifest.slice_id,
        start_at: manifest.start_at_ms,
        duration_ms: manifest.duration_ms,
        drop_count: manifest.drop_count,
        bomb_count: manifest.bomb_count,
        big_count: manifest.big_count,
        empty_count: manifest.empty_count,
        big_multiplier: manifest.big_multiplier,
        window_ms: manifest.window_ms,
        score_total: manifest.score_total,
        offsets_ms: viewed.offsets_ms,
        drop_types,
        seed_commit: seed_commit(outcome_seed, reveal_salt),
    }
}

/// Ineligible users see any in-play round as merely Locked.
pub fn mask_round_for(round: &Round, eligible: bool) -> Round {
    let mut masked = round.clone();
    if !eligible
        && masked.status != RoundStatus::Waiting
        && masked.status != RoundStatus::Locked
    {
        masked.status = RoundStatus::Locked;
    }
    masked
}

/// Slice payloads only flow while the schedule is relevant and only to
/// eligible users.
pub fn slices_visible(status: RoundStatus, eligible: bool) -> bool {
    eligible
        && matches!(
            status,
            RoundStatus::Running | RoundStatus::Countdown | RoundStatus::Locked
        )
}

#[allow(clippy::too_many_arguments)]
pub fn round_state_payload(
    round: &Round,
    manifests: Option<&[SliceManifest]>,
    reveal_salt: &str,
    eligible: Option<bool>,
    online_count: usize,
    whitelist_count: i64,
    user_id: i64,
) -> Value {
    let mut payload = json!({
        "round": round,
        "server_time": now_ms(),
        "online_count": online_count,
        "whitelist_count": whitelist_count,
    });
    if let Some(eligible) = eligible {
        payload["eligible"] = json!(eligible);
    }
    if user_id > 0 && eligible.unwrap_or(true) && slices_visible(round.status, true) {
        if let Some(manifests) = manifests {
            let slices: Vec<SlicePayload> = manifests
                .iter()
                .map(|m| build_slice_payload(m, reveal_salt, user_id))
                .collect();
            payload["slices"] = json!(slices);
        }
    }
    payload
}
