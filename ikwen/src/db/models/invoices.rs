//! Database models for invoices.

use crate::billing::status::InvoiceStatus;
use crate::types::{InvoiceId, MemberId, ServiceId, SubscriptionId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use utoipa::ToSchema;

/// One line of an invoice, stored in the invoice's `entries` JSON column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InvoiceEntry {
    pub label: String,
    #[serde(default)]
    pub short_description: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub total: Decimal,
}

impl InvoiceEntry {
    pub fn new(label: impl Into<String>, quantity: i32, unit_price: Decimal) -> Self {
        Self {
            label: label.into(),
            short_description: String::new(),
            quantity,
            unit_price,
            total: unit_price * Decimal::from(quantity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvoiceCreateDBRequest {
    pub service_id: ServiceId,
    pub subscription_id: SubscriptionId,
    pub member_id: Option<MemberId>,
    pub number: String,
    pub amount: Decimal,
    pub months_count: i32,
    pub date_issued: DateTime<Utc>,
    pub due_date: NaiveDate,
    pub is_one_off: bool,
    pub entries: Vec<InvoiceEntry>,
}

/// Editable fields of an unpaid invoice. `paid` and `status` only change through payments and
/// the invoicing jobs.
#[derive(Debug, Clone, Default)]
pub struct InvoiceUpdateDBRequest {
    pub amount: Option<Decimal>,
    pub due_date: Option<NaiveDate>,
    pub months_count: Option<i32>,
    pub entries: Option<Vec<InvoiceEntry>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct InvoiceDBResponse {
    pub id: InvoiceId,
    pub service_id: ServiceId,
    pub subscription_id: SubscriptionId,
    pub member_id: Option<MemberId>,
    pub number: String,
    pub amount: Decimal,
    pub paid: Decimal,
    pub processing_fees: Decimal,
    pub months_count: i32,
    pub date_issued: DateTime<Utc>,
    pub due_date: NaiveDate,
    pub reminders_sent: i32,
    pub last_reminder: Option<DateTime<Utc>>,
    pub overdue_notices_sent: i32,
    pub last_overdue_notice: Option<DateTime<Utc>>,
    pub status: InvoiceStatus,
    pub is_one_off: bool,
    pub entries: Json<Vec<InvoiceEntry>>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceDBResponse {
    pub fn balance_due(&self) -> Decimal {
        self.amount - self.paid
    }
}
