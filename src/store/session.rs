use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

use super::keys;

/// Server-side session records. A token is only as good as the session it
/// names: logout or expiry kills the redis key and every channel opened with
/// that token with it.
#[derive(Clone)]
pub struct SessionStore {
    con: ConnectionManager,
}

impl SessionStore {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    pub async fn save(&self, user_id: i64, session_id: &str, ttl_secs: i64) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("SET")
            .arg(keys::session(user_id))
            .arg(session_id)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut con)
            .await
            .context("SET session failed")?;
        Ok(())
    }

    /// Ok(true) only when the stored session matches. A store outage is an
    /// error, not a silent rejection, so the caller can answer 503.
    pub async fn validate(&self, user_id: i64, session_id: &str) -> Result<bool> {
        let mut con = self.con.clone();
        let stored: Option<String> = redis::cmd("GET")
            .arg(keys::session(user_id))
            .query_async(&mut con)
            .await
            .context("GET session failed")?;
        Ok(stored.as_deref() == Some(session_id))
    }

    pub async fn drop_session(&self, user_id: i64) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("DEL")
            .arg(keys::session(user_id))
            .query_async::<_, ()>(&mut con)
            .await
            .context("DEL session failed")?;
        Ok(())
    }
}
