pub mod cache;
pub mod config;
pub mod contacts;
pub mod contracts;
pub mod db;
pub mod mailer;
pub mod redis_bus;

pub use cache::{PgCacheStore, ensure_schema};
pub use config::{MirrorConfig, ServiceConfig};
pub use contacts::PgContactDirectory;
pub use contracts::{
    AcceptDealRequest, DealsIndexedEvent, FundDealRequest, HealthResponse, RegisterContactRequest,
    ReputationQuery, SubmitEvidenceRequest, VoteRequest,
};
pub use db::connect_database;
pub use mailer::{LogMailer, RedisMailer};
pub use redis_bus::{DEALS_INDEXED_CHANNEL, NOTIFICATIONS_CHANNEL, RedisBus};
