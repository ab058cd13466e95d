use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;

use crate::db::rounds::NewRound;
use crate::game::clock::now_ms;

use super::{error_reply, json_reply, Server};

fn default_unset() -> i64 {
    -1
}

/// Round creation request. `-1` means "not set" for the fields where zero is
/// a meaningful choice (no bombs, no penalty).
#[derive(Debug, Deserialize)]
pub struct CreateRoundRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub total_pool: i64,
    #[serde(default)]
    pub duration_sec: i64,
    #[serde(default)]
    pub slice_ms: i64,
    #[serde(default)]
    pub drops_per_slice: i64,
    #[serde(default = "default_unset")]
    pub bombs_per_slice: i64,
    #[serde(default = "default_unset")]
    pub bigs_per_slice: i64,
    #[serde(default = "default_unset")]
    pub empty_per_slice: i64,
    #[serde(default)]
    pub big_multiplier: f64,
    #[serde(default)]
    pub max_speed: f64,
    #[serde(default)]
    pub drop_visible_ms: i64,
    #[serde(default)]
    pub score_total: i64,
    #[serde(default = "default_unset")]
    pub bomb_penalty: i64,
    #[serde(default)]
    pub lucky_ratio: i64,
    #[serde(default)]
    pub base_ratio: i64,
}

#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StartRoundRequest {
    #[serde(default)]
    pub countdown_sec: i64,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub round_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

/// Fills unset fields with the launch defaults and validates the layout.
/// Errors are operator-facing strings.
pub fn normalize_new_round(mut req: CreateRoundRequest) -> Result<NewRound, String> {
    if req.duration_sec <= 0 {
        return Err("duration required".into());
    }
    if req.total_pool <= 0 {
        return Err("total_pool required".into());
    }
    let duration_ms = req.duration_sec * 1000;
    if req.slice_ms <= 0 {
        req.slice_ms = 1000;
    }
    if req.slice_ms > duration_ms {
        req.slice_ms = duration_ms;
    }
    if req.drops_per_slice <= 0 {
        // target roughly six drops a second across the round
        let mut slice_count = duration_ms / req.slice_ms;
        if slice_count <= 0 {
            slice_count = req.duration_sec;
        }
        let total_drops = (req.duration_sec * 6).max(req.duration_sec * 4);
        let mut drops = (total_drops / slice_count).clamp(4, 12);
        if req.bombs_per_slice > 0 && drops <= req.bombs_per_slice {
            drops = req.bombs_per_slice + 1;
        }
        req.drops_per_slice = drops;
    }
    if req.bombs_per_slice < 0 {
        let bombs = ((req.drops_per_slice as f64 * 0.2) as i64).max(1);
        req.bombs_per_slice = bombs.min(req.drops_per_slice - 1);
    }
    if req.bigs_per_slice < 0 {
        req.bigs_per_slice = 0;
    }
    if req.empty_per_slice < 0 {
        req.empty_per_slice = 0;
    }
    if req.big_multiplier <= 1.0 {
        req.big_multiplier = 2.0;
    }
    if req.max_speed <= 0.0 {
        req.max_speed = 1.0;
    }
    if req.drop_visible_ms < 0 {
        req.drop_visible_ms = 0;
    }
    if req.score_total <= 0 {
        req.score_total = 1000;
    }
    if req.bomb_penalty < 0 {
        req.bomb_penalty = 50;
    }
    req.lucky_ratio = req.lucky_ratio.max(0);
    req.base_ratio = req.base_ratio.max(0);
    if req.lucky_ratio == 0 && req.base_ratio == 0 {
        req.lucky_ratio = 40;
        req.base_ratio = 60;
    }
    if req.lucky_ratio + req.base_ratio > 100 {
        return Err("lucky_ratio + base_ratio must be <= 100".into());
    }
    if req.bombs_per_slice >= req.drops_per_slice {
        return Err("invalid bomb config".into());
    }
    req.bigs_per_slice = req
        .bigs_per_slice
        .min(req.drops_per_slice - req.bombs_per_slice)
        .max(0);
    req.empty_per_slice = req
        .empty_per_slice
        .min(req.drops_per_slice - req.bombs_per_slice - req.bigs_per_slice)
        .max(0);

    Ok(NewRound {
        title: req.title,
        total_pool: req.total_pool,
        duration_sec: req.duration_sec,
        slice_ms: req.slice_ms,
        drops_per_slice: req.drops_per_slice,
        bombs_per_slice: req.bombs_per_slice,
        bigs_per_slice: req.bigs_per_slice,
        empty_per_slice: req.empty_per_slice,
        big_multiplier: req.big_multiplier,
        max_speed: req.max_speed,
        drop_visible_ms: req.drop_visible_ms,
        score_total: req.score_total,
        bomb_penalty: req.bomb_penalty,
        lucky_ratio: req.lucky_ratio,
        base_ratio: req.base_ratio,
    })
}

fn check_admin(srv: &Server, token: Option<&str>) -> Result<(), Response> {
    let configured = srv.cfg.admin_token.trim();
    if configured.is_empty() {
        return Err(json_reply(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "admin token not configured" }),
        ));
    }
    if token.map(str::trim) != Some(configured) {
        return Err(json_reply(
            StatusCode::UNAUTHORIZED,
            &json!({ "error": "invalid admin token" }),
        ));
    }
    Ok(())
}

pub async fn create_round(
    token: Option<String>,
    req: CreateRoundRequest,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    let new = match normalize_new_round(req) {
        Ok(new) => new,
        Err(msg) => return Ok(json_reply(StatusCode::BAD_REQUEST, &json!({ "error": msg }))),
    };
    match srv.rounds.create(&new).await {
        Ok(id) => Ok(json_reply(StatusCode::OK, &json!({ "id": id }))),
        Err(err) => {
            tracing::error!(%err, "round insert failed");
            Ok(json_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "error": "db error" }),
            ))
        }
    }
}

pub async fn add_whitelist(
    round_id: i64,
    token: Option<String>,
    req: WhitelistRequest,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    if req.user_ids.is_empty() {
        return Ok(json_reply(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "empty whitelist" }),
        ));
    }
    if let Err(err) = srv.rounds.whitelist_add(round_id, &req.user_ids).await {
        tracing::error!(%err, "whitelist insert failed");
        return Ok(json_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "error": "db error" }),
        ));
    }
    // A locked or running round keeps its store-side set in sync.
    if let Ok(Some(round)) = srv.rounds.get(round_id).await {
        if round.status != crate::models::RoundStatus::Waiting {
            if let Err(err) = srv.store.whitelist_add(round_id, &req.user_ids).await {
                tracing::warn!(%err, "whitelist store sync failed");
            }
        }
    }
    Ok(json_reply(
        StatusCode::OK,
        &json!({ "status": "ok", "count": req.user_ids.len() }),
    ))
}

pub async fn lock_round(
    round_id: i64,
    token: Option<String>,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    match srv.lock_round(round_id).await {
        Ok(()) => Ok(json_reply(StatusCode::OK, &json!({ "status": "locked" }))),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn start_round(
    round_id: i64,
    token: Option<String>,
    req: StartRoundRequest,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    match srv.clone().start_round(round_id, req.countdown_sec).await {
        Ok(start_at) => Ok(json_reply(
            StatusCode::OK,
            &json!({ "status": "countdown", "start_at": start_at }),
        )),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn draw_round(
    round_id: i64,
    token: Option<String>,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    match srv.draw_round(round_id).await {
        Ok(()) => Ok(json_reply(StatusCode::OK, &json!({ "status": "drawn" }))),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn clear_round(
    round_id: i64,
    token: Option<String>,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    match srv.clear_round(round_id).await {
        Ok(()) => Ok(json_reply(StatusCode::OK, &json!({ "status": "cleared" }))),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn confirm_award(
    batch_id: i64,
    token: Option<String>,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    match srv.confirm_award(batch_id).await {
        Ok(()) => Ok(json_reply(StatusCode::OK, &json!({ "status": "confirmed" }))),
        Err(err) => Ok(error_reply(&err)),
    }
}

/// Operator dashboard numbers for a round (default: the current one).
pub async fn metrics(
    token: Option<String>,
    query: MetricsQuery,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    let round = match query.round_id {
        Some(id) => srv.rounds.get(id).await.ok().flatten(),
        None => srv.game.current().map(|rt| rt.round),
    };
    let now = now_ms();
    let mut time_left = 0i64;
    let mut qps_avg = 0i64;
    let mut qps_1s = 0i64;
    let mut score_sum = 0i64;
    let mut score_users = 0i64;
    if let Some(round) = &round {
        if round.end_at_ms > 0 {
            time_left = (round.end_at_ms - now).max(0);
        }
        if let Ok((avg, last)) = srv.store.qps_window(round.id, now).await {
            qps_avg = avg;
            qps_1s = last;
        }
        score_users = srv.store.participant_count(round.id).await.unwrap_or(0);
        score_sum = match srv.store.score_sum(round.id).await {
            Ok(Some(sum)) => sum,
            Ok(None) => {
                let ttl = srv.current_round_ttl(round.id);
                srv.store.rebuild_score_sum(round.id, ttl).await.unwrap_or(0)
            }
            Err(_) => 0,
        };
    }
    Ok(json_reply(
        StatusCode::OK,
        &json!({
            "online_users": srv.hub.online_count(),
            "round": round,
            "time_left_ms": time_left,
            "server_time": now,
            "qps_avg": qps_avg,
            "qps_1s": qps_1s,
            "score_sum": score_sum,
            "score_users": score_users,
        }),
    ))
}

/// Reverse-score leaderboard; falls back to the persisted award details once
/// the round keys have expired.
pub async fn leaderboard(
    round_id: i64,
    token: Option<String>,
    query: LeaderboardQuery,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    if let Err(resp) = check_admin(&srv, token.as_deref()) {
        return Ok(resp);
    }
    let limit = query.limit.unwrap_or(10).clamp(1, 1000);
    let mut items = srv.store.leaderboard(round_id, limit).await.unwrap_or_default();
    if items.is_empty() {
        items = srv.awards.top_scores(round_id, limit).await.unwrap_or_default();
    }
    let items: Vec<_> = items
        .into_iter()
        .map(|(user_id, score)| json!({ "user_id": user_id, "score": score }))
        .collect();
    Ok(json_reply(StatusCode::OK, &json!({ "items": items })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_req() -> CreateRoundRequest {
        CreateRoundRequest {
            title: "t".into(),
            total_pool: 10_000,
            duration_sec: 30,
            slice_ms: 0,
            drops_per_slice: 0,
            bombs_per_slice: -1,
            bigs_per_slice: -1,
            empty_per_slice: -1,
            big_multiplier: 0.0,
            max_speed: 0.0,
            drop_visible_ms: 0,
            score_total: 0,
            bomb_penalty: -1,
            lucky_ratio: 0,
            base_ratio: 0,
        }
    }

    #[test]
    fn test_defaults_fill_in() {
        let new = normalize_new_round(base_req()).unwrap();
        assert_eq!(new.slice_ms, 1000);
        assert_eq!(new.drops_per_slice, 6);
        assert_eq!(new.bombs_per_slice, 1);
        assert_eq!(new.bigs_per_slice, 0);
        assert_eq!(new.empty_per_slice, 0);
        assert_eq!(new.big_multiplier, 2.0);
        assert_eq!(new.score_total, 1000);
        assert_eq!(new.bomb_penalty, 50);
        assert_eq!((new.lucky_ratio, new.base_ratio), (40, 60));
    }

    #[test]
    fn test_explicit_zero_bombs_kept() {
        let mut req = base_req();
        req.bombs_per_slice = 0;
        req.bomb_penalty = 0;
        let new = normalize_new_round(req).unwrap();
        assert_eq!(new.bombs_per_slice, 0);
        assert_eq!(new.bomb_penalty, 0);
    }

    #[test]
    fn test_required_fields() {
        let mut req = base_req();
        req.duration_sec = 0;
        assert!(normalize_new_round(req).is_err());
        let mut req = base_req();
        req.total_pool = 0;
        assert!(normalize_new_round(req).is_err());
    }

    #[test]
    fn test_ratio_sum_rejected() {
        let mut req = base_req();
        req.lucky_ratio = 60;
        req.base_ratio = 60;
        assert!(normalize_new_round(req).is_err());
    }

    #[test]
    fn test_bomb_overflow_rejected_and_bigs_clamped() {
        let mut req = base_req();
        req.drops_per_slice = 4;
        req.bombs_per_slice = 4;
        assert!(normalize_new_round(req).is_err());

        let mut req = base_req();
        req.drops_per_slice = 6;
        req.bombs_per_slice = 2;
        req.bigs_per_slice = 10;
        req.empty_per_slice = 10;
        let new = normalize_new_round(req).unwrap();
        assert_eq!(new.bigs_per_slice, 4);
        assert_eq!(new.empty_per_slice, 0);
    }

    #[test]
    fn test_slice_ms_clamped_to_duration() {
        let mut req = base_req();
        req.duration_sec = 2;
        req.slice_ms = 60_000;
        let new = normalize_new_round(req).unwrap();
        assert_eq!(new.slice_ms, 2_000);
    }
}
