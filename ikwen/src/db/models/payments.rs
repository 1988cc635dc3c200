//! Database models for payments and payment means.

use crate::types::{InvoiceId, MemberId, PaymentId, PaymentMeanId, ServiceId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::fmt;
use utoipa::ToSchema;

/// How an invoice payment was collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum PaymentMethod {
    Cash,
    WalletDebit,
    MobileMoney,
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "Cash",
            PaymentMethod::WalletDebit => "WalletDebit",
            PaymentMethod::MobileMoney => "MobileMoney",
            PaymentMethod::BankTransfer => "BankTransfer",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PaymentCreateDBRequest {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub cashier_id: Option<MemberId>,
    pub processor_tx_id: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentDBResponse {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub method: String,
    pub amount: Decimal,
    pub cashier_id: Option<MemberId>,
    pub processor_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PaymentMeanCreateDBRequest {
    pub service_id: ServiceId,
    pub name: String,
    pub slug: String,
    pub credentials: serde_json::Value,
    pub is_active: bool,
}

/// A payment channel a tenant offers, with the credentials of its provider account
#[derive(Debug, Clone, FromRow)]
pub struct PaymentMeanDBResponse {
    pub id: PaymentMeanId,
    pub service_id: ServiceId,
    pub name: String,
    pub slug: String,
    pub credentials: Json<serde_json::Value>,
    pub is_active: bool,
}
