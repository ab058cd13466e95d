use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use redrain::config::Config;
use redrain::server::{qps, routes, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::load();
    cfg.validate()?;

    let addr: SocketAddr = cfg
        .http_addr
        .parse()
        .with_context(|| format!("invalid HTTP_ADDR {:?}", cfg.http_addr))?;

    let pool = redrain::db::connect(&cfg.database_url).await?;
    let redis_client =
        redis::Client::open(cfg.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_con = redis_client
        .get_connection_manager()
        .await
        .context("failed to establish redis connection")?;

    let srv = Server::new(cfg, pool, redis_con);

    // Durable status is the source of truth across restarts.
    srv.clone().recover_current_round().await?;

    if srv.cfg.qps_flusher_enabled {
        qps::spawn_qps_flusher(srv.clone());
    }

    tracing::info!(%addr, "listening");
    warp::serve(routes(srv)).run(addr).await;
    Ok(())
}
