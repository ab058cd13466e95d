use anyhow::{Context, Result};
use sqlx::{PgPool, QueryBuilder, Row};

use crate::game::payout::Allocation;
use crate::models::RoundStatus;

const REASON_ROUND_AWARD: &str = "ROUND_AWARD";

#[derive(Clone)]
pub struct AwardRepo {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct UserResult {
    pub score: i64,
    pub amount: i64,
    pub base_amount: i64,
    pub lucky_amount: i64,
}

impl AwardRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persists the settled distribution: batch row, one detail row per
    /// winner and the round's PendingConfirm status, all in one transaction.
    /// Nothing is visible to confirmation until the commit lands.
    pub async fn persist_batch(
        &self,
        round_id: i64,
        total_pool: i64,
        allocs: &[Allocation],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("failed to begin draw tx")?;

        let row = sqlx::query(
            "INSERT INTO award_batches (round_id, total_pool, status) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(round_id)
        .bind(total_pool)
        .bind(RoundStatus::PendingConfirm.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert award batch")?;
        let batch_id: i64 = row.get("id");

        for chunk in allocs.chunks(100) {
            let mut builder = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO award_details (batch_id, user_id, score, amount, base_amount, lucky_amount) ",
            );
            builder.push_values(chunk, |mut b, a| {
                b.push_bind(batch_id)
                    .push_bind(a.user_id)
                    .push_bind(a.score)
                    .push_bind(a.amount)
                    .push_bind(a.base_amount)
                    .push_bind(a.lucky_amount);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("failed to insert award details")?;
        }

        sqlx::query("UPDATE rounds SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(RoundStatus::PendingConfirm.as_str())
            .bind(round_id)
            .execute(&mut *tx)
            .await
            .context("failed to mark round pending confirm")?;

        tx.commit().await.context("failed to commit draw tx")?;
        Ok(batch_id)
    }

    /// Credits wallets for a batch. Idempotent: the batch row is taken under
    /// a row lock and an already-Confirmed batch commits without effect.
    /// Transient connection failures are retried once.
    pub async fn confirm(&self, batch_id: i64) -> Result<i64> {
        match self.confirm_once(batch_id).await {
            Ok(round_id) => Ok(round_id),
            Err(err) if is_bad_conn(&err) => {
                tracing::warn!(batch_id, %err, "confirm hit a bad connection, retrying once");
                self.confirm_once(batch_id).await
            }
            Err(err) => Err(err),
        }
    }

    async fn confirm_once(&self, batch_id: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("failed to begin confirm tx")?;

        let row = sqlx::query("SELECT round_id, status FROM award_batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to lock award batch")?
            .with_context(|| format!("award batch {batch_id} not found"))?;
        let round_id: i64 = row.get("round_id");
        let status: String = row.get("status");
        if status == "CONFIRMED" {
            tx.commit().await.context("failed to commit no-op confirm")?;
            return Ok(round_id);
        }

        let details = sqlx::query("SELECT user_id, amount FROM award_details WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_all(&mut *tx)
            .await
            .context("failed to load award details")?;

        for detail in &details {
            let user_id: i64 = detail.get("user_id");
            let amount: i64 = detail.get("amount");
            sqlx::query(
                r#"
                INSERT INTO wallets (user_id, balance, updated_at) VALUES ($1, $2, NOW())
                ON CONFLICT (user_id)
                DO UPDATE SET balance = wallets.balance + EXCLUDED.balance, updated_at = NOW()
                "#,
            )
            .bind(user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await
            .context("failed to credit wallet")?;

            sqlx::query(
                "INSERT INTO wallet_ledger (user_id, amount, reason, ref_id) VALUES ($1, $2, $3, $4)",
            )
            .bind(user_id)
            .bind(amount)
            .bind(REASON_ROUND_AWARD)
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .context("failed to append ledger entry")?;
        }

        sqlx::query("UPDATE award_batches SET status = 'CONFIRMED', confirmed_at = NOW() WHERE id = $1")
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .context("failed to mark batch confirmed")?;

        sqlx::query("UPDATE rounds SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(RoundStatus::Finished.as_str())
            .bind(round_id)
            .execute(&mut *tx)
            .await
            .context("failed to finish round")?;

        tx.commit().await.context("failed to commit confirm tx")?;
        Ok(round_id)
    }

    /// Leaderboard fallback once the store keys have expired.
    pub async fn top_scores(&self, round_id: i64, limit: i64) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT ad.user_id, ad.score
            FROM award_details ad
            JOIN award_batches ab ON ad.batch_id = ab.id
            WHERE ab.round_id = $1
            ORDER BY ad.score DESC LIMIT $2
            "#,
        )
        .bind(round_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load score fallback")?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("user_id"), r.get::<i64, _>("score")))
            .collect())
    }

    /// A user's settled result for a round; VOID batches are ignored.
    pub async fn user_result(&self, round_id: i64, user_id: i64) -> Result<Option<UserResult>> {
        let row = sqlx::query(
            r#"
            SELECT ad.score, ad.amount, ad.base_amount, ad.lucky_amount
            FROM award_details ad
            JOIN award_batches ab ON ad.batch_id = ab.id
            WHERE ab.round_id = $1 AND ab.status <> 'VOID' AND ad.user_id = $2
            ORDER BY ad.created_at DESC LIMIT 1
            "#,
        )
        .bind(round_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user result")?;
        Ok(row.map(|r| UserResult {
            score: r.get("score"),
            amount: r.get("amount"),
            base_amount: r.get("base_amount"),
            lucky_amount: r.get("lucky_amount"),
        }))
    }
}

fn is_bad_conn(err: &anyhow::Error) -> bool {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        return matches!(sqlx_err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut);
    }
    err.to_string().contains("bad connection")
}
