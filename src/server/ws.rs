use std::convert::Infallible;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::Reply;

use crate::auth::{verify_click_sign, Claims};
use crate::game::clock::now_ms;
use crate::hub::Hub;

use super::messages::{
    mask_round_for, round_state_payload, ws_message, ClickRequest, CompactClick, InboundFrame,
};
use super::{AuthFailure, Server};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `/ws?token=…`: authentication happens before the upgrade so a bad token
/// is a plain 401, not a connect-then-close.
pub async fn upgrade(
    ws: warp::ws::Ws,
    query: WsQuery,
    srv: Arc<Server>,
) -> Result<warp::reply::Response, Infallible> {
    match srv.authenticate(query.token.as_deref()).await {
        Ok(claims) => Ok(ws
            .on_upgrade(move |socket| run_channel(srv, socket, claims))
            .into_response()),
        Err(AuthFailure::Unauthorized) => {
            Ok(warp::reply::with_status("unauthorized", StatusCode::UNAUTHORIZED).into_response())
        }
        Err(AuthFailure::Unavailable) => Ok(warp::reply::with_status(
            "session store unavailable",
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .into_response()),
    }
}

async fn run_channel(srv: Arc<Server>, socket: WebSocket, claims: Claims) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = Hub::channel();
    let client_id = srv.hub.register(claims.user_id, tx.clone());
    srv.mark_online(claims.user_id).await;
    tracing::debug!(user_id = claims.user_id, client_id, "channel open");

    // Writer task: the single place this connection's frames are written,
    // which gives each client an ordered view of its own messages.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    send_hello(&srv, &claims, &tx);
    send_initial_state(&srv, &claims, &tx).await;

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let Ok(text) = msg.to_str() else {
            continue; // binary/control frames are not part of the protocol
        };
        let Ok(inbound) = serde_json::from_str::<InboundFrame>(text) else {
            continue;
        };
        match inbound.msg_type.as_str() {
            "ping" => {
                srv.mark_online(claims.user_id).await;
                push(
                    &tx,
                    ws_message(
                        "pong",
                        json!({
                            "ts": inbound.ts,
                            "seq": inbound.seq,
                            "server_time": now_ms(),
                        }),
                    ),
                );
            }
            "click" | "c" => {
                handle_click(&srv, &claims, &tx, inbound).await;
            }
            _ => {}
        }
    }

    srv.hub.unregister(claims.user_id, client_id);
    drop(tx);
    let _ = writer.await;
    tracing::debug!(user_id = claims.user_id, client_id, "channel closed");
}

fn send_hello(srv: &Server, claims: &Claims, tx: &tokio::sync::mpsc::Sender<Message>) {
    let sign_key = srv
        .sign_key_for(&claims.session_id)
        .map(hex::encode)
        .unwrap_or_default();
    push(
        tx,
        ws_message(
            "hello",
            json!({
                "server_time": now_ms(),
                "sign_key": sign_key,
                "user": { "id": claims.user_id },
            }),
        ),
    );
}

async fn send_initial_state(srv: &Server, claims: &Claims, tx: &tokio::sync::mpsc::Sender<Message>) {
    let Some(rt) = srv.game.current() else {
        return;
    };
    let eligible = srv.is_whitelisted(rt.round.id, claims.user_id).await;
    let masked = mask_round_for(&rt.round, eligible);
    let whitelist_count = srv.store.whitelist_count(rt.round.id).await.unwrap_or(0);
    let online_count = srv
        .presence
        .active_online(now_ms())
        .await
        .map(|ids| ids.len())
        .unwrap_or(0);
    let manifests: Vec<_> = rt.slices.iter().map(|s| s.manifest.clone()).collect();
    let payload = round_state_payload(
        &masked,
        Some(&manifests),
        &rt.reveal_salt,
        Some(eligible),
        online_count,
        whitelist_count,
        claims.user_id,
    );
    push(tx, ws_message("round_state", payload));
}

async fn handle_click(
    srv: &Server,
    claims: &Claims,
    tx: &tokio::sync::mpsc::Sender<Message>,
    inbound: InboundFrame,
) {
    let compact = inbound.msg_type == "c";
    let resp_type = if compact { "cr" } else { "click_result" };

    let (req, mut seq) = parse_click(&inbound);
    if seq == 0 {
        seq = inbound.seq;
    }
    if req.round_id <= 0 {
        push(tx, ws_message(resp_type, json!({ "e": "invalid request" })));
        return;
    }
    srv.mark_online(claims.user_id).await;

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
        push(
            tx,
            ws_message(
                resp_type,
                json!({ "s": seq, "r": req.round_id, "d": req.drop_id, "e": "invalid sign" }),
            ),
        );
        return;
    }

    match srv
        .process_click(claims.user_id, req.round_id, req.drop_id, req.client_ts)
        .await
    {
        Ok(res) => {
            let data = if compact {
                json!({
                    "s": seq,
                    "r": req.round_id,
                    "d": req.drop_id,
                    "v": res.delta,
                    "t": res.total,
                    "b": res.bomb as i64,
                })
            } else {
                json!({
                    "round_id": req.round_id,
                    "drop_id": req.drop_id,
                    "delta": res.delta,
                    "total": res.total,
                    "bomb": res.bomb,
                })
            };
            push(tx, ws_message(resp_type, data));
        }
        Err(err) => {
            push(
                tx,
                ws_message(
                    resp_type,
                    json!({ "s": seq, "r": req.round_id, "d": req.drop_id, "e": err.to_string() }),
                ),
            );
        }
    }
}

/// Accepts both the verbose `{round_id, drop_id, …}` and the compact
/// `{r, d, t, s, seq}` click forms.
fn parse_click(inbound: &InboundFrame) -> (ClickRequest, i64) {
    if let Ok(short) = serde_json::from_value::<CompactClick>(inbound.data.clone()) {
        if short.r > 0 {
            return (
                ClickRequest {
                    round_id: short.r,
                    drop_id: short.d,
                    client_ts: short.t,
                    sign: short.s,
                },
                short.seq,
            );
        }
    }
    let req = serde_json::from_value::<ClickRequest>(inbound.data.clone()).unwrap_or_default();
    (req, 0)
}

/// Queue push with drop-on-overflow, same policy as the hub.
fn push(tx: &tokio::sync::mpsc::Sender<Message>, msg: Message) {
    let _ = tx.try_send(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_click() {
        let inbound: InboundFrame = serde_json::from_str(
            r#"{"type":"c","data":{"r":5,"d":12,"t":1700000000123,"s":"abcd","seq":9}}"#,
        )
        .unwrap();
        let (req, seq) = parse_click(&inbound);
        assert_eq!(req.round_id, 5);
        assert_eq!(req.drop_id, 12);
        assert_eq!(req.client_ts, 1_700_000_000_123);
        assert_eq!(req.sign, "abcd");
        assert_eq!(seq, 9);
    }

    #[test]
    fn test_parse_verbose_click() {
        let inbound: InboundFrame = serde_json::from_str(
            r#"{"type":"click","seq":4,"data":{"round_id":5,"drop_id":1,"client_ts":7,"sign":"ff"}}"#,
        )
        .unwrap();
        let (req, seq) = parse_click(&inbound);
        assert_eq!(req.round_id, 5);
        assert_eq!(req.drop_id, 1);
        assert_eq!(seq, 0); // falls back to the frame-level seq at the caller
        assert_eq!(inbound.seq, 4);
    }

    #[test]
    fn test_parse_garbage_click() {
        let inbound: InboundFrame =
            serde_json::from_str(r#"{"type":"click","data":"nonsense"}"#).unwrap();
        let (req, _) = parse_click(&inbound);
        assert_eq!(req.round_id, 0);
    }
}
