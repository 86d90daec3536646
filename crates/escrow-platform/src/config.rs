use std::time::Duration;

use anyhow::{Context, Result, bail};
use escrow_engine::StatusUpdateMode;

const DEFAULT_LEDGER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_PAGE_SIZE: usize = 100;
/// Mirror nodes serve at most this many topic messages per request.
const MAX_LOG_PAGE_SIZE: usize = 100;
const DEFAULT_INDEXER_POLL_SECS: u64 = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorConfig {
    pub base_url: String,
    pub topic_id: String,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub http_addr: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Without it the service runs against the in-process contract simulator.
    pub ledger_rpc_url: Option<String>,
    pub ledger_timeout: Duration,
    pub mirror: Option<MirrorConfig>,
    pub status_update_mode: StatusUpdateMode,
    pub log_page_size: usize,
    pub indexer_poll_interval: Duration,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        Self::from_lookup(default_http_addr, |key| std::env::var(key).ok())
    }

    /// The indexer needs somewhere to read from and somewhere to write to.
    pub fn worker_from_env() -> Result<Self> {
        let config = Self::from_env("")?;
        if config.database_url.is_none() {
            bail!("DATABASE_URL is required");
        }
        if config.mirror.is_none() {
            bail!("MIRROR_NODE_URL and LOG_TOPIC_ID are required");
        }
        Ok(config)
    }

    pub fn from_lookup(
        default_http_addr: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mirror = match (var("MIRROR_NODE_URL"), var("LOG_TOPIC_ID")) {
            (Some(base_url), Some(topic_id)) => Some(MirrorConfig { base_url, topic_id }),
            (None, None) => None,
            _ => bail!("MIRROR_NODE_URL and LOG_TOPIC_ID must be set together"),
        };

        let status_update_mode = match var("STATUS_UPDATE_MODE") {
            Some(raw) => raw.parse::<StatusUpdateMode>()?,
            None => StatusUpdateMode::default(),
        };

        let ledger_timeout_secs: u64 =
            parse_or(&var, "LEDGER_TIMEOUT_SECS", DEFAULT_LEDGER_TIMEOUT_SECS)?;
        if ledger_timeout_secs == 0 {
            bail!("LEDGER_TIMEOUT_SECS must be positive");
        }
        let log_page_size: usize = parse_or(&var, "LOG_PAGE_SIZE", DEFAULT_LOG_PAGE_SIZE)?;
        let indexer_poll_secs: u64 =
            parse_or(&var, "INDEXER_POLL_SECS", DEFAULT_INDEXER_POLL_SECS)?;

        Ok(Self {
            http_addr: var("HTTP_ADDR").unwrap_or_else(|| default_http_addr.to_string()),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            ledger_rpc_url: var("LEDGER_RPC_URL"),
            ledger_timeout: Duration::from_secs(ledger_timeout_secs),
            mirror,
            status_update_mode,
            log_page_size: log_page_size.clamp(1, MAX_LOG_PAGE_SIZE),
            indexer_poll_interval: Duration::from_secs(indexer_poll_secs.max(1)),
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number (got '{raw}')")),
        None => Ok(default),
    }
}
