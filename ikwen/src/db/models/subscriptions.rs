//! Database models for subscriptions.

use crate::billing::{cycle::BillingCycle, status::SubscriptionStatus};
use crate::types::{MemberId, ProductId, ServiceId, SubscriptionId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(Debug, Clone)]
pub struct SubscriptionCreateDBRequest {
    pub service_id: ServiceId,
    pub member_id: MemberId,
    pub product_id: Option<ProductId>,
    pub monthly_cost: Decimal,
    pub billing_cycle: BillingCycle,
    pub details: String,
    pub expiry: Option<NaiveDate>,
    pub invoice_tolerance: i32,
    pub status: SubscriptionStatus,
}

/// Status is not part of the update request: it only moves through
/// [`crate::db::handlers::Subscriptions::transition`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdateDBRequest {
    pub product_id: Option<ProductId>,
    pub monthly_cost: Option<Decimal>,
    pub billing_cycle: Option<BillingCycle>,
    pub details: Option<String>,
    pub expiry: Option<NaiveDate>,
    pub invoice_tolerance: Option<i32>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionDBResponse {
    pub id: SubscriptionId,
    pub service_id: ServiceId,
    pub member_id: MemberId,
    pub product_id: Option<ProductId>,
    pub monthly_cost: Decimal,
    pub billing_cycle: BillingCycle,
    pub details: String,
    pub expiry: Option<NaiveDate>,
    pub invoice_tolerance: i32,
    pub status: SubscriptionStatus,
    pub since: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
