mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use escrow_platform::{PgCacheStore, RedisBus, ServiceConfig, connect_database, ensure_schema};
use escrow_store::MirrorLogReader;
use tracing::{error, info};

use crate::worker::Indexer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "escrow_indexer=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required")?;
    let mirror = config
        .mirror
        .as_ref()
        .context("MIRROR_NODE_URL and LOG_TOPIC_ID are required")?;

    let pool = connect_database(database_url).await?;
    ensure_schema(&pool).await?;
    let reader = MirrorLogReader::new(&mirror.base_url, &mirror.topic_id, config.ledger_timeout)?;

    let mut indexer = Indexer::new(
        Arc::new(reader),
        Arc::new(PgCacheStore::new(pool)),
        config.log_page_size,
    );
    if let Some(redis_url) = &config.redis_url {
        indexer = indexer.with_bus(RedisBus::connect(redis_url)?);
    }

    info!(
        topic_id = %mirror.topic_id,
        poll_secs = config.indexer_poll_interval.as_secs(),
        "indexer replaying consensus log"
    );

    let mut ticker = tokio::time::interval(config.indexer_poll_interval);
    loop {
        ticker.tick().await;
        if let Err(err) = indexer.run_pass().await {
            error!("failed to index consensus log: {err:#}");
        }
    }
}
