//! Repositories for operator wallets and messaging balances.
//!
//! Both live in the `wallets` database alias. Rows are created lazily on first use, so a
//! service created on the default database needs no matching insert here.

use crate::db::{
    errors::{DbError, Result},
    models::wallets::{MessagingBalanceDBResponse, OperatorWalletDBResponse},
};
use crate::types::{ServiceId, abbrev_uuid};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::instrument;

pub struct OperatorWallets<'c> {
    db: &'c mut PgConnection,
}

impl<'c> OperatorWallets<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Wallets of a service, richest first
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn list(&mut self, service_id: ServiceId) -> Result<Vec<OperatorWalletDBResponse>> {
        let wallets = sqlx::query_as::<_, OperatorWalletDBResponse>(
            "SELECT service_id, provider, balance, updated_at FROM operator_wallets WHERE service_id = $1 ORDER BY balance DESC, provider",
        )
        .bind(service_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(wallets)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn credit(&mut self, service_id: ServiceId, provider: &str, amount: Decimal) -> Result<OperatorWalletDBResponse> {
        let wallet = sqlx::query_as::<_, OperatorWalletDBResponse>(
            r#"
            INSERT INTO operator_wallets (service_id, provider, balance) VALUES ($1, $2, $3)
            ON CONFLICT (service_id, provider) DO UPDATE SET balance = operator_wallets.balance + EXCLUDED.balance, updated_at = NOW()
            RETURNING service_id, provider, balance, updated_at
            "#,
        )
        .bind(service_id)
        .bind(provider)
        .bind(amount)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(wallet)
    }

    /// Debit a wallet. Returns `None` when the balance does not cover `amount`.
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn debit(&mut self, service_id: ServiceId, provider: &str, amount: Decimal) -> Result<Option<OperatorWalletDBResponse>> {
        let wallet = sqlx::query_as::<_, OperatorWalletDBResponse>(
            r#"
            UPDATE operator_wallets SET balance = balance - $3, updated_at = NOW()
            WHERE service_id = $1 AND provider = $2 AND balance >= $3
            RETURNING service_id, provider, balance, updated_at
            "#,
        )
        .bind(service_id)
        .bind(provider)
        .bind(amount)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(wallet)
    }
}

pub struct MessagingBalances<'c> {
    db: &'c mut PgConnection,
}

impl<'c> MessagingBalances<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get(&mut self, service_id: ServiceId) -> Result<MessagingBalanceDBResponse> {
        let balance = sqlx::query_as::<_, MessagingBalanceDBResponse>(
            r#"
            INSERT INTO messaging_balances (service_id) VALUES ($1)
            ON CONFLICT (service_id) DO UPDATE SET service_id = EXCLUDED.service_id
            RETURNING service_id, mail_count, sms_count
            "#,
        )
        .bind(service_id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(balance)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn credit(&mut self, service_id: ServiceId, mail: i32, sms: i32) -> Result<MessagingBalanceDBResponse> {
        let balance = sqlx::query_as::<_, MessagingBalanceDBResponse>(
            r#"
            INSERT INTO messaging_balances (service_id, mail_count, sms_count) VALUES ($1, $2, $3)
            ON CONFLICT (service_id) DO UPDATE SET
                mail_count = messaging_balances.mail_count + EXCLUDED.mail_count,
                sms_count = messaging_balances.sms_count + EXCLUDED.sms_count
            RETURNING service_id, mail_count, sms_count
            "#,
        )
        .bind(service_id)
        .bind(mail)
        .bind(sms)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(balance)
    }

    /// Take `count` mail credits. Returns false, leaving the balance untouched, when the
    /// balance is too low.
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn debit_mail(&mut self, service_id: ServiceId, count: i32) -> Result<bool> {
        let result = sqlx::query("UPDATE messaging_balances SET mail_count = mail_count - $2 WHERE service_id = $1 AND mail_count >= $2")
            .bind(service_id)
            .bind(count)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Give back credits taken for mails that could not be sent
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn refund_mail(&mut self, service_id: ServiceId, count: i32) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        let result = sqlx::query("UPDATE messaging_balances SET mail_count = mail_count + $2 WHERE service_id = $1")
            .bind(service_id)
            .bind(count)
            .execute(&mut *self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn debit_sms(&mut self, service_id: ServiceId, count: i32) -> Result<bool> {
        let result = sqlx::query("UPDATE messaging_balances SET sms_count = sms_count - $2 WHERE service_id = $1 AND sms_count >= $2")
            .bind(service_id)
            .bind(count)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
