use anyhow::{anyhow, bail, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Identity carried by a bearer token. Login itself lives outside this
/// service; the token format here is the contract the core authenticates
/// channels and clicks against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: i64,
    pub session_id: String,
}

/// Token layout: `uid.session_id.expiry_ms.sig` with
/// `sig = HMAC-SHA256(secret, "uid.session_id.expiry_ms")` hex-encoded.
pub fn sign_token(secret: &str, user_id: i64, session_id: &str, expires_at_ms: i64) -> String {
    let body = format!("{user_id}.{session_id}.{expires_at_ms}");
    let sig = hmac_hex(secret.as_bytes(), body.as_bytes());
    format!("{body}.{sig}")
}

pub fn parse_token(secret: &str, token: &str, now_ms: i64) -> Result<Claims> {
    let mut parts = token.rsplitn(2, '.');
    let sig = parts.next().ok_or_else(|| anyhow!("malformed token"))?;
    let body = parts.next().ok_or_else(|| anyhow!("malformed token"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| anyhow!("bad secret"))?;
    mac.update(body.as_bytes());
    let sig_bytes = hex::decode(sig).map_err(|_| anyhow!("malformed token"))?;
    mac.verify_slice(&sig_bytes).map_err(|_| anyhow!("invalid token signature"))?;

    let fields: Vec<&str> = body.split('.').collect();
    if fields.len() != 3 {
        bail!("malformed token");
    }
    let user_id: i64 = fields[0].parse().map_err(|_| anyhow!("malformed token"))?;
    let expires_at_ms: i64 = fields[2].parse().map_err(|_| anyhow!("malformed token"))?;
    if expires_at_ms <= now_ms {
        bail!("token expired");
    }
    Ok(Claims {
        user_id,
        session_id: fields[1].to_string(),
    })
}

/// Per-session click-signing key. Disabled (None) while the deployment still
/// runs the placeholder secret, which keeps unsigned dev traffic obvious.
pub fn game_sign_key(game_secret: &str, session_id: &str) -> Option<[u8; 32]> {
    let secret = game_secret.trim();
    if secret.is_empty() || secret == "change-me" {
        return None;
    }
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(session_id.as_bytes());
    let bytes = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(key)
}

/// Verifies the HMAC a client attaches to each click, computed over
/// `"{user}|{round}|{drop}|{client_ts}"` with the session sign key.
pub fn verify_click_sign(
    key: &[u8; 32],
    user_id: i64,
    round_id: i64,
    drop_id: i64,
    client_ts: i64,
    sign: &str,
) -> bool {
    let sign = sign.trim();
    if sign.is_empty() {
        return false;
    }
    let Ok(sig_bytes) = hex::decode(sign) else {
        return false;
    };
    let msg = format!("{user_id}|{round_id}|{drop_id}|{client_ts}");
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(msg.as_bytes());
    mac.verify_slice(&sig_bytes).is_ok()
}

pub fn sign_click(key: &[u8; 32], user_id: i64, round_id: i64, drop_id: i64, client_ts: i64) -> String {
    let msg = format!("{user_id}|{round_id}|{drop_id}|{client_ts}");
    hmac_hex(key, msg.as_bytes())
}

pub fn new_session_id() -> String {
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn hmac_hex(key: &[u8], msg: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}
