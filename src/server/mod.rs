pub mod admin;
pub mod game_api;
pub mod lifecycle;
pub mod messages;
pub mod qps;
pub mod ws;

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::auth::{self, Claims};
use crate::config::Config;
use crate::db::awards::AwardRepo;
use crate::db::rounds::RoundRepo;
use crate::error::GameError;
use crate::game::clock::{effective_now, now_ms};
use crate::game::{ClickResult, GameManager};
use crate::hub::Hub;
use crate::store::score::round_key_ttl_secs;
use crate::store::{Presence, ScoreStore, SessionStore};

pub struct Server {
    pub cfg: Config,
    pub game: GameManager,
    pub store: ScoreStore,
    pub presence: Presence,
    pub sessions: SessionStore,
    pub hub: Hub,
    pub rounds: RoundRepo,
    pub awards: AwardRepo,
    pub qps: qps::QpsCounters,
}

pub enum AuthFailure {
    /// Bad or stale credentials: 401.
    Unauthorized,
    /// The session store could not answer: 503.
    Unavailable,
}

impl Server {
    pub fn new(cfg: Config, pool: PgPool, redis_con: redis::aio::ConnectionManager) -> Arc<Server> {
        let store = ScoreStore::new(redis_con.clone());
        let game = GameManager::new(
            store.clone(),
            cfg.min_speed_mult,
            cfg.time_skew_ms,
            cfg.click_grace_ms,
            cfg.runtime_cache_users,
            cfg.runtime_cache_slices,
        );
        Arc::new(Server {
            game,
            store,
            presence: Presence::new(redis_con.clone()),
            sessions: SessionStore::new(redis_con),
            hub: Hub::new(),
            rounds: RoundRepo::new(pool.clone()),
            awards: AwardRepo::new(pool),
            qps: qps::QpsCounters::new(),
            cfg,
        })
    }

    /// Resolves a bearer token (header value or raw query token) into a live
    /// session.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Claims, AuthFailure> {
        let token = token
            .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).trim())
            .filter(|t| !t.is_empty())
            .ok_or(AuthFailure::Unauthorized)?;
        let claims = auth::parse_token(&self.cfg.auth_token_secret, token, now_ms())
            .map_err(|_| AuthFailure::Unauthorized)?;
        match self.sessions.validate(claims.user_id, &claims.session_id).await {
            Ok(true) => Ok(claims),
            Ok(false) => Err(AuthFailure::Unauthorized),
            Err(err) => {
                tracing::error!(%err, "session store unavailable");
                Err(AuthFailure::Unavailable)
            }
        }
    }

    pub fn sign_key_for(&self, session_id: &str) -> Option<[u8; 32]> {
        auth::game_sign_key(&self.cfg.game_sign_secret, session_id)
    }

    /// Whitelist membership with a DB fallback that repairs the redis set.
    pub async fn is_whitelisted(&self, round_id: i64, user_id: i64) -> bool {
        match self.store.is_whitelisted(round_id, user_id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, "whitelist read failed, falling back to db"),
        }
        match self.rounds.is_whitelisted(round_id, user_id).await {
            Ok(true) => {
                if let Err(err) = self.store.whitelist_add(round_id, &[user_id]).await {
                    tracing::warn!(%err, "whitelist repair failed");
                }
                true
            }
            _ => false,
        }
    }

    pub async fn mark_online(&self, user_id: i64) {
        self.presence.mark_online(user_id, now_ms()).await;
    }

    /// Shared click pipeline for the channel and HTTP paths. The signature
    /// has already been verified by the caller.
    pub async fn process_click(
        &self,
        user_id: i64,
        round_id: i64,
        drop_id: i64,
        client_ts: i64,
    ) -> Result<ClickResult, GameError> {
        if !self.is_whitelisted(round_id, user_id).await {
            return Err(GameError::NotWhitelisted);
        }
        let server_now = now_ms();
        let effective = effective_now(
            client_ts,
            server_now,
            self.cfg.time_skew_ms,
            self.cfg.click_grace_ms,
        );
        let result = self
            .game
            .validate_click(user_id, round_id, drop_id, effective)
            .await?;

        if self.cfg.click_stream_enabled {
            let ttl = self.current_round_ttl(round_id);
            if let Err(err) = self
                .store
                .append_click_event(round_id, user_id, drop_id, result.delta, result.bomb, server_now, ttl)
                .await
            {
                tracing::warn!(%err, "click stream append failed");
            }
        }
        self.qps.bump(round_id);
        Ok(result)
    }

    pub fn current_round_ttl(&self, round_id: i64) -> i64 {
        match self.game.current() {
            Some(rt) if rt.round.id == round_id => round_key_ttl_secs(rt.round.end_at_ms, now_ms()),
            _ => round_key_ttl_secs(0, now_ms()),
        }
    }
}

pub fn json_reply(status: StatusCode, value: &Value) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

pub fn error_status(err: &GameError) -> StatusCode {
    match err {
        GameError::InvalidSign => StatusCode::UNAUTHORIZED,
        GameError::NotWhitelisted => StatusCode::FORBIDDEN,
        GameError::RoundNotFound => StatusCode::NOT_FOUND,
        GameError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        GameError::Db(_) | GameError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn error_reply(err: &GameError) -> warp::reply::Response {
    if !err.is_expected() {
        tracing::warn!(%err, "request failed");
    }
    json_reply(error_status(err), &serde_json::json!({ "error": err.to_string() }))
}

fn with_server(
    srv: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || srv.clone())
}

/// Full route tree.
pub fn routes(
    srv: Arc<Server>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let current = warp::path!("api" / "rounds" / "current")
        .and(warp::get())
        .and(with_server(srv.clone()))
        .and_then(game_api::current_round);

    let state = warp::path!("api" / "game" / "state")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<game_api::StateQuery>())
        .and(with_server(srv.clone()))
        .and_then(game_api::game_state);

    let click = warp::path!("api" / "game" / "click")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::json())
        .and(with_server(srv.clone()))
        .and_then(game_api::click);

    let reveal = warp::path!("api" / "game" / "reveal")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<game_api::RevealQuery>())
        .and(with_server(srv.clone()))
        .and_then(game_api::reveal);

    let result = warp::path!("api" / "game" / "result")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<game_api::ResultQuery>())
        .and(with_server(srv.clone()))
        .and_then(game_api::result);

    let ws_route = warp::path!("ws")
        .and(warp::ws())
        .and(warp::query::<ws::WsQuery>())
        .and(with_server(srv.clone()))
        .and_then(ws::upgrade);

    let admin_token = warp::header::optional::<String>("x-admin-token");

    let admin_create = warp::path!("api" / "admin" / "rounds")
        .and(warp::post())
        .and(admin_token)
        .and(warp::body::json())
        .and(with_server(srv.clone()))
        .and_then(admin::create_round);

    let admin_whitelist = warp::path!("api" / "admin" / "rounds" / i64 / "whitelist")
        .and(warp::post())
        .and(admin_token)
        .and(warp::body::json())
        .and(with_server(srv.clone()))
        .and_then(admin::add_whitelist);

    let admin_lock = warp::path!("api" / "admin" / "rounds" / i64 / "lock")
        .and(warp::post())
        .and(admin_token)
        .and(with_server(srv.clone()))
        .and_then(admin::lock_round);

    let admin_start = warp::path!("api" / "admin" / "rounds" / i64 / "start")
        .and(warp::post())
        .and(admin_token)
        .and(warp::body::json())
        .and(with_server(srv.clone()))
        .and_then(admin::start_round);

    let admin_draw = warp::path!("api" / "admin" / "rounds" / i64 / "draw")
        .and(warp::post())
        .and(admin_token)
        .and(with_server(srv.clone()))
        .and_then(admin::draw_round);

    let admin_clear = warp::path!("api" / "admin" / "rounds" / i64 / "clear")
        .and(warp::post())
        .and(admin_token)
        .and(with_server(srv.clone()))
        .and_then(admin::clear_round);

    let admin_confirm = warp::path!("api" / "admin" / "awards" / i64 / "confirm")
        .and(warp::post())
        .and(admin_token)
        .and(with_server(srv.clone()))
        .and_then(admin::confirm_award);

    let admin_metrics = warp::path!("api" / "admin" / "metrics")
        .and(warp::get())
        .and(admin_token)
        .and(warp::query::<admin::MetricsQuery>())
        .and(with_server(srv.clone()))
        .and_then(admin::metrics);

    let admin_leaderboard = warp::path!("api" / "admin" / "rounds" / i64 / "leaderboard")
        .and(warp::get())
        .and(admin_token)
        .and(warp::query::<admin::LeaderboardQuery>())
        .and(with_server(srv))
        .and_then(admin::leaderboard);

    current
        .or(state)
        .or(click)
        .or(reveal)
        .or(result)
        .or(ws_route)
        .or(admin_create)
        .or(admin_whitelist)
        .or(admin_lock)
        .or(admin_start)
        .or(admin_draw)
        .or(admin_clear)
        .or(admin_confirm)
        .or(admin_metrics)
        .or(admin_leaderboard)
}
