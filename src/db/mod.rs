pub mod awards;
pub mod rounds;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to database")?;
    initialize_schema(&pool).await?;
    Ok(pool)
}

async fn initialize_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rounds (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            total_pool BIGINT NOT NULL,
            duration_sec BIGINT NOT NULL,
            slice_ms BIGINT NOT NULL,
            drops_per_slice BIGINT NOT NULL,
            bombs_per_slice BIGINT NOT NULL,
            bigs_per_slice BIGINT NOT NULL,
            empty_per_slice BIGINT NOT NULL,
            big_multiplier DOUBLE PRECISION NOT NULL,
            max_speed DOUBLE PRECISION NOT NULL,
            drop_visible_ms BIGINT NOT NULL DEFAULT 0,
            score_total BIGINT NOT NULL,
            bomb_penalty BIGINT NOT NULL,
            lucky_ratio BIGINT NOT NULL,
            base_ratio BIGINT NOT NULL,
            status VARCHAR(20) NOT NULL,
            start_at_ms BIGINT NOT NULL DEFAULT 0,
            end_at_ms BIGINT NOT NULL DEFAULT 0,
            seed BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create rounds table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS round_whitelist (
            round_id BIGINT NOT NULL,
            user_id BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (round_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create round_whitelist table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS award_batches (
            id BIGSERIAL PRIMARY KEY,
            round_id BIGINT NOT NULL,
            total_pool BIGINT NOT NULL,
            status VARCHAR(20) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            confirmed_at TIMESTAMPTZ
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create award_batches table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS award_details (
            id BIGSERIAL PRIMARY KEY,
            batch_id BIGINT NOT NULL,
            user_id BIGINT NOT NULL,
            score BIGINT NOT NULL,
            amount BIGINT NOT NULL,
            base_amount BIGINT NOT NULL,
            lucky_amount BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create award_details table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS award_details_batch_idx ON award_details (batch_id)")
        .execute(pool)
        .await
        .context("failed to create award_details index")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wallets (
            user_id BIGINT PRIMARY KEY,
            balance BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create wallets table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wallet_ledger (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL,
            amount BIGINT NOT NULL,
            reason VARCHAR(32) NOT NULL,
            ref_id BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create wallet_ledger table")?;

    Ok(())
}
