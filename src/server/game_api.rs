use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;

use crate::auth::{verify_click_sign, Claims};
use crate::game::clock::now_ms;
use crate::game::slice::{seed_commit, user_seed};

use super::messages::{build_slice_payload, mask_round_for, slices_visible, ClickRequest, SlicePayload};
use super::{error_reply, json_reply, AuthFailure, Server};

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub with_slices: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevealQuery {
    pub round_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    pub round_id: i64,
}

async fn require_auth(srv: &Server, header: Option<&str>) -> Result<Claims, Response> {
    match srv.authenticate(header).await {
        Ok(claims) => Ok(claims),
        Err(AuthFailure::Unauthorized) => Err(json_reply(
            StatusCode::UNAUTHORIZED,
            &json!({ "error": "unauthorized" }),
        )),
        Err(AuthFailure::Unavailable) => Err(json_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({ "error": "session store unavailable" }),
        )),
    }
}

/// Public snapshot of the current round; no auth, no per-user data.
pub async fn current_round(srv: Arc<Server>) -> Result<Response, Infallible> {
    let round = srv.game.current().map(|rt| rt.round);
    Ok(json_reply(StatusCode::OK, &json!({ "round": round })))
}

/// Per-user view: masked round, score, eligibility, counts, sign key and
/// (while the schedule is live) the per-slice payloads.
pub async fn game_state(
    auth: Option<String>,
    query: StateQuery,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    let claims = match require_auth(&srv, auth.as_deref()).await {
        Ok(c) => c,
        Err(resp) => return Ok(resp),
    };
    let Some(rt) = srv.game.current() else {
        return Ok(json_reply(StatusCode::OK, &json!({ "round": null })));
    };

    srv.mark_online(claims.user_id).await;
    let with_slices = !matches!(
        query.with_slices.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("0") | Some("false") | Some("no")
    );

    let score = srv.store.user_score(rt.round.id, claims.user_id).await.unwrap_or(0);
    let eligible = srv.is_whitelisted(rt.round.id, claims.user_id).await;
    let whitelist_count = srv.store.whitelist_count(rt.round.id).await.unwrap_or(0);
    let online_count = srv
        .presence
        .active_online(now_ms())
        .await
        .map(|ids| ids.len())
        .unwrap_or(0);

    let masked = mask_round_for(&rt.round, eligible);
    let show_slices = with_slices && slices_visible(masked.status, eligible);
    let mut payload = json!({
        "round": masked,
        "score": score,
        "eligible": eligible,
        "online_count": online_count,
        "whitelist_count": whitelist_count,
        "server_time": now_ms(),
    });
    if let Some(key) = srv.sign_key_for(&claims.session_id) {
        payload["sign_key"] = json!(hex::encode(key));
    }
    if show_slices {
        let slices: Vec<SlicePayload> = rt
            .slices
            .iter()
            .map(|s| build_slice_payload(&s.manifest, &rt.reveal_salt, claims.user_id))
            .collect();
        payload["slices"] = json!(slices);
    }
    Ok(json_reply(StatusCode::OK, &payload))
}

/// HTTP click; same semantics as the channel click.
pub async fn click(
    auth: Option<String>,
    req: ClickRequest,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    let claims = match require_auth(&srv, auth.as_deref()).await {
        Ok(c) => c,
        Err(resp) => return Ok(resp),
    };
    if req.round_id <= 0 {
        return Ok(json_reply(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "invalid request" }),
        ));
    }
    let signed = srv.sign_key_for(&claims.session_id).is_some_and(|key| {
        verify_click_sign(
            &key,
            claims.user_id,
            req.round_id,
            req.drop_id,
            req.client_ts,
            &req.sign,
        )
    });
    if !signed {
        return Ok(json_reply(
            StatusCode::UNAUTHORIZED,
            &json!({ "error": "invalid sign" }),
        ));
    }
    match srv
        .process_click(claims.user_id, req.round_id, req.drop_id, req.client_ts)
        .await
    {
        Ok(res) => Ok(json_reply(
            StatusCode::OK,
            &json!({ "delta": res.delta, "total": res.total, "bomb": res.bomb }),
        )),
        Err(err) => Ok(error_reply(&err)),
    }
}

/// Post-round fairness data: available from ReadyDraw onward, per user.
pub async fn reveal(
    auth: Option<String>,
    query: RevealQuery,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    let claims = match require_auth(&srv, auth.as_deref()).await {
        Ok(c) => c,
        Err(resp) => return Ok(resp),
    };
    let Some(rt) = srv.game.current() else {
        return Ok(json_reply(StatusCode::OK, &json!({ "round": null })));
    };
    let round_id = match query.round_id {
        Some(id) if id != 0 => id,
        _ => rt.round.id,
    };
    if rt.round.id != round_id {
        return Ok(json_reply(
            StatusCode::NOT_FOUND,
            &json!({ "error": "round not found" }),
        ));
    }
    if !rt.round.status.reveal_open() {
        return Ok(json_reply(
            StatusCode::FORBIDDEN,
            &json!({ "error": "reveal not available" }),
        ));
    }
    if rt.reveal_salt.is_empty() {
        return Ok(json_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "error": "reveal not available" }),
        ));
    }
    let slices: Vec<_> = rt
        .slices
        .iter()
        .map(|s| {
            let seed = user_seed(s.manifest.seed, claims.user_id);
            json!({
                "slice_id": s.manifest.slice_id,
                "seed": seed,
                "seed_commit": seed_commit(seed, &rt.reveal_salt),
            })
        })
        .collect();
    Ok(json_reply(
        StatusCode::OK,
        &json!({
            "round_id": rt.round.id,
            "salt": rt.reveal_salt,
            "slices": slices,
        }),
    ))
}

/// A user's settled result for a drawn round.
pub async fn result(
    auth: Option<String>,
    query: ResultQuery,
    srv: Arc<Server>,
) -> Result<Response, Infallible> {
    let claims = match require_auth(&srv, auth.as_deref()).await {
        Ok(c) => c,
        Err(resp) => return Ok(resp),
    };
    match srv.awards.user_result(query.round_id, claims.user_id).await {
        Ok(Some(res)) => Ok(json_reply(
            StatusCode::OK,
            &json!({
                "score": res.score,
                "amount": res.amount,
                "base_amount": res.base_amount,
                "lucky_amount": res.lucky_amount,
            }),
        )),
        Ok(None) => Ok(json_reply(StatusCode::OK, &json!({ "score": 0, "amount": 0 }))),
        Err(err) => {
            tracing::error!(%err, "result lookup failed");
            Ok(json_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "error": "db error" }),
            ))
        }
    }
}
