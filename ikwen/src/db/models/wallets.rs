//! Database models for operator wallets and messaging balances (`wallets` database).

use crate::types::ServiceId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

/// Money collected for a tenant through a provider, available for paying ikwen invoices
#[derive(Debug, Clone, FromRow)]
pub struct OperatorWalletDBResponse {
    pub service_id: ServiceId,
    pub provider: String,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Prepaid mail and SMS credit of a tenant
#[derive(Debug, Clone, FromRow)]
pub struct MessagingBalanceDBResponse {
    pub service_id: ServiceId,
    pub mail_count: i32,
    pub sms_count: i32,
}
