use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};

use crate::models::{Round, RoundStatus};

/// Parameters for a new round; everything else is derived or set at start.
#[derive(Debug, Clone)]
pub struct NewRound {
    pub title: String,
    pub total_pool: i64,
    pub duration_sec: i64,
    pub slice_ms: i64,
    pub drops_per_slice: i64,
    pub bombs_per_slice: i64,
    pub bigs_per_slice: i64,
    pub empty_per_slice: i64,
    pub big_multiplier: f64,
    pub max_speed: f64,
    pub drop_visible_ms: i64,
    pub score_total: i64,
    pub bomb_penalty: i64,
    pub lucky_ratio: i64,
    pub base_ratio: i64,
}

#[derive(Clone)]
pub struct RoundRepo {
    pool: PgPool,
}

impl RoundRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewRound) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO rounds
                (title, total_pool, duration_sec, slice_ms, drops_per_slice, bombs_per_slice,
                 bigs_per_slice, empty_per_slice, big_multiplier, max_speed, drop_visible_ms,
                 score_total, bomb_penalty, lucky_ratio, base_ratio, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(&new.title)
        .bind(new.total_pool)
        .bind(new.duration_sec)
        .bind(new.slice_ms)
        .bind(new.drops_per_slice)
        .bind(new.bombs_per_slice)
        .bind(new.bigs_per_slice)
        .bind(new.empty_per_slice)
        .bind(new.big_multiplier)
        .bind(new.max_speed)
        .bind(new.drop_visible_ms)
        .bind(new.score_total)
        .bind(new.bomb_penalty)
        .bind(new.lucky_ratio)
        .bind(new.base_ratio)
        .bind(RoundStatus::Waiting.as_str())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert round")?;
        Ok(row.get::<i64, _>("id"))
    }

    pub async fn get(&self, round_id: i64) -> Result<Option<Round>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, total_pool, duration_sec, slice_ms, drops_per_slice,
                   bombs_per_slice, bigs_per_slice, empty_per_slice, big_multiplier, max_speed,
                   drop_visible_ms, score_total, bomb_penalty, lucky_ratio, base_ratio,
                   status, start_at_ms, end_at_ms, seed
            FROM rounds WHERE id = $1
            "#,
        )
        .bind(round_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load round")?;
        row.map(row_to_round).transpose()
    }

    /// The round a restarted process should re-adopt, if any.
    pub async fn latest_active(&self) -> Result<Option<Round>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, total_pool, duration_sec, slice_ms, drops_per_slice,
                   bombs_per_slice, bigs_per_slice, empty_per_slice, big_multiplier, max_speed,
                   drop_visible_ms, score_total, bomb_penalty, lucky_ratio, base_ratio,
                   status, start_at_ms, end_at_ms, seed
            FROM rounds
            WHERE status IN ('COUNTDOWN', 'RUNNING', 'READY_DRAW', 'DRAWING', 'PENDING_CONFIRM')
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load active round")?;
        row.map(row_to_round).transpose()
    }

    pub async fn set_status(&self, round_id: i64, status: RoundStatus) -> Result<()> {
        sqlx::query("UPDATE rounds SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(round_id)
            .execute(&self.pool)
            .await
            .context("failed to update round status")?;
        Ok(())
    }

    /// Fixes the start parameters at the Locked -> Countdown transition.
    pub async fn begin_countdown(
        &self,
        round_id: i64,
        start_at_ms: i64,
        end_at_ms: i64,
        seed: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rounds SET status = $1, start_at_ms = $2, end_at_ms = $3, seed = $4,
                   updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(RoundStatus::Countdown.as_str())
        .bind(start_at_ms)
        .bind(end_at_ms)
        .bind(i64::from(seed))
        .bind(round_id)
        .execute(&self.pool)
        .await
        .context("failed to start countdown")?;
        Ok(())
    }

    pub async fn whitelist_add(&self, round_id: i64, user_ids: &[i64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        // Batched multi-row insert; duplicates are expected and skipped.
        for chunk in user_ids.chunks(100) {
            let mut builder = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO round_whitelist (round_id, user_id) ",
            );
            builder.push_values(chunk, |mut b, uid| {
                b.push_bind(round_id).push_bind(uid);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder
                .build()
                .execute(&self.pool)
                .await
                .context("failed to insert whitelist batch")?;
        }
        Ok(())
    }

    pub async fn whitelist_ids(&self, round_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT user_id FROM round_whitelist WHERE round_id = $1")
            .bind(round_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to load whitelist")?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("user_id")).collect())
    }

    pub async fn is_whitelisted(&self, round_id: i64, user_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM round_whitelist WHERE round_id = $1 AND user_id = $2 LIMIT 1",
        )
        .bind(round_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check whitelist")?;
        Ok(row.is_some())
    }
}

fn row_to_round(row: PgRow) -> Result<Round> {
    let status_str: String = row.get("status");
    let status = RoundStatus::parse(&status_str)
        .with_context(|| format!("unknown round status {status_str:?}"))?;
    Ok(Round {
        id: row.get("id"),
        title: row.get("title"),
        total_pool: row.get("total_pool"),
        duration_sec: row.get("duration_sec"),
        slice_ms: row.get("slice_ms"),
        drops_per_slice: row.get("drops_per_slice"),
        bombs_per_slice: row.get("bombs_per_slice"),
        bigs_per_slice: row.get("bigs_per_slice"),
        empty_per_slice: row.get("empty_per_slice"),
        big_multiplier: row.get("big_multiplier"),
        max_speed: row.get("max_speed"),
        drop_visible_ms: row.get("drop_visible_ms"),
        score_total: row.get("score_total"),
        bomb_penalty: row.get("bomb_penalty"),
        lucky_ratio: row.get("lucky_ratio"),
        base_ratio: row.get("base_ratio"),
        status,
        start_at_ms: row.get("start_at_ms"),
        end_at_ms: row.get("end_at_ms"),
        seed: row.get::<i64, _>("seed") as u32,
    })
}
