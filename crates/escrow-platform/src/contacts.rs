use anyhow::Result;
use async_trait::async_trait;
use escrow_core::AccountId;
use escrow_engine::ContactDirectory;
use sqlx::{PgPool, Row};

/// Contact addresses registered per ledger account.
#[derive(Clone)]
pub struct PgContactDirectory {
    pool: PgPool,
}

impl PgContactDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, account: &AccountId, email: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_contacts (account_id, email, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (account_id)
            DO UPDATE SET
                email = EXCLUDED.email,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.as_str())
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ContactDirectory for PgContactDirectory {
    async fn email_for(&self, account: &AccountId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT email FROM escrow_contacts WHERE account_id = $1")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let email: Option<String> = row.try_get("email")?;
                Ok(email.filter(|email| !email.trim().is_empty()))
            }
            None => Ok(None),
        }
    }
}
