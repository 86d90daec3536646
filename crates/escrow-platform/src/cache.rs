use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escrow_core::{AccountId, ArbiterPanel, CacheStore, Deal, DealId, DealRecord, Vote};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS escrow_deals (
        deal_id TEXT PRIMARY KEY,
        buyer TEXT NOT NULL,
        seller TEXT NOT NULL,
        arbiter TEXT,
        arbiters TEXT[] NOT NULL DEFAULT '{}',
        required_votes INTEGER,
        amount BIGINT NOT NULL,
        asset_type TEXT NOT NULL,
        asset_id TEXT,
        asset_serial_number BIGINT,
        arbiter_fee_type TEXT NOT NULL,
        arbiter_fee_amount NUMERIC NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        seller_accepted BOOLEAN NOT NULL DEFAULT FALSE,
        arbiter_accepted BOOLEAN NOT NULL DEFAULT FALSE,
        funds_deposited BOOLEAN NOT NULL DEFAULT FALSE,
        evidence_hash TEXT,
        votes JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS escrow_deals_created_at_idx ON escrow_deals (created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS escrow_contacts (
        account_id TEXT PRIMARY KEY,
        email TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const DEAL_COLUMNS: &str = "deal_id, buyer, seller, arbiter, arbiters, required_votes, amount, \
    asset_type, asset_id, asset_serial_number, arbiter_fee_type, arbiter_fee_amount, status, \
    seller_accepted, arbiter_accepted, funds_deposited, evidence_hash, votes, created_at, updated_at";

/// Creates the cache tables when they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to prepare cache schema")?;
    }
    Ok(())
}

/// PostgreSQL mirror of deal state, one row per deal.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn upsert(&self, deal: &Deal) -> Result<()> {
        let (arbiter, arbiters, required_votes) = match &deal.panel {
            ArbiterPanel::Single(arbiter) => (Some(arbiter.as_str()), Vec::new(), None),
            ArbiterPanel::Multi {
                arbiters,
                required_votes,
            } => (
                None,
                arbiters.iter().map(|a| a.as_str().to_string()).collect::<Vec<_>>(),
                Some(*required_votes as i32),
            ),
        };
        let amount = i64::try_from(deal.amount).context("deal amount exceeds BIGINT")?;
        let votes = serde_json::to_value(&deal.votes)?;

        sqlx::query(
            r#"
            INSERT INTO escrow_deals (
                deal_id,
                buyer,
                seller,
                arbiter,
                arbiters,
                required_votes,
                amount,
                asset_type,
                asset_id,
                asset_serial_number,
                arbiter_fee_type,
                arbiter_fee_amount,
                status,
                seller_accepted,
                arbiter_accepted,
                funds_deposited,
                evidence_hash,
                votes,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (deal_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                seller_accepted = EXCLUDED.seller_accepted,
                arbiter_accepted = EXCLUDED.arbiter_accepted,
                funds_deposited = EXCLUDED.funds_deposited,
                evidence_hash = EXCLUDED.evidence_hash,
                votes = EXCLUDED.votes,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(deal.deal_id.as_str())
        .bind(deal.buyer.as_str())
        .bind(deal.seller.as_str())
        .bind(arbiter)
        .bind(&arbiters)
        .bind(required_votes)
        .bind(amount)
        .bind(deal.asset.asset_type().as_str())
        .bind(deal.asset.token_id())
        .bind(deal.asset.serial_number())
        .bind(deal.fee.fee_type().as_str())
        .bind(deal.fee.amount())
        .bind(deal.status.as_str())
        .bind(deal.seller_accepted)
        .bind(deal.arbiter_accepted)
        .bind(deal.funds_deposited)
        .bind(deal.evidence_hash.as_deref())
        .bind(votes)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert deal {}", deal.deal_id))?;

        Ok(())
    }

    async fn get(&self, deal_id: &DealId) -> Result<Option<Deal>> {
        let query = format!("SELECT {DEAL_COLUMNS} FROM escrow_deals WHERE deal_id = $1");
        let row = sqlx::query(&query)
            .bind(deal_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(deal_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Deal>> {
        let query = format!("SELECT {DEAL_COLUMNS} FROM escrow_deals ORDER BY created_at DESC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(deal_from_row).collect()
    }

    async fn deal_ids(&self) -> Result<Vec<DealId>> {
        let rows = sqlx::query("SELECT deal_id FROM escrow_deals")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<DealId> {
                let raw: String = row.try_get("deal_id")?;
                Ok(DealId::parse(&raw)?)
            })
            .collect()
    }
}

fn deal_from_row(row: &PgRow) -> Result<Deal> {
    let deal_id: String = row.try_get("deal_id")?;
    let arbiter: Option<String> = row.try_get("arbiter")?;
    let arbiters: Vec<String> = row.try_get("arbiters")?;
    let required_votes: Option<i32> = row.try_get("required_votes")?;
    let amount: i64 = row.try_get("amount")?;
    let asset_type: String = row.try_get("asset_type")?;
    let fee_type: String = row.try_get("arbiter_fee_type")?;
    let status: String = row.try_get("status")?;
    let votes: serde_json::Value = row.try_get("votes")?;
    let votes: Vec<Vote> = serde_json::from_value(votes)
        .with_context(|| format!("cached votes for deal {deal_id} are malformed"))?;

    let record = DealRecord {
        deal_id: DealId::parse(&deal_id)?,
        buyer: AccountId::parse(row.try_get::<String, _>("buyer")?.as_str())?,
        seller: AccountId::parse(row.try_get::<String, _>("seller")?.as_str())?,
        arbiter: arbiter.as_deref().map(AccountId::parse).transpose()?,
        arbiters: arbiters
            .iter()
            .map(|raw| AccountId::parse(raw))
            .collect::<Result<Vec<_>, _>>()?,
        required_votes: required_votes
            .map(u32::try_from)
            .transpose()
            .context("required_votes is negative")?,
        amount: u64::try_from(amount).context("cached amount is negative")?,
        asset_type: asset_type.parse()?,
        asset_id: row.try_get("asset_id")?,
        asset_serial_number: row.try_get("asset_serial_number")?,
        arbiter_fee_type: fee_type.parse()?,
        arbiter_fee_amount: row.try_get::<Decimal, _>("arbiter_fee_amount")?,
        status: status.parse()?,
        seller_accepted: row.try_get("seller_accepted")?,
        arbiter_accepted: row.try_get("arbiter_accepted")?,
        funds_deposited: row.try_get("funds_deposited")?,
        evidence_hash: row.try_get("evidence_hash")?,
        votes,
        seller_vote_count: 0,
        buyer_vote_count: 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: Some(row.try_get::<DateTime<Utc>, _>("updated_at")?),
    };

    Deal::try_from(record).with_context(|| format!("cached deal {deal_id} is inconsistent"))
}
