//! Database models for mobile money transactions.

use crate::types::{ServiceId, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Outcome of a mobile money transaction. Only `Pending` transactions are running.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "momo_tx_status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failure,
    /// Still pending when the provider's deadline passed
    Dropped,
    Timeout,
    #[serde(rename = "SSLError")]
    SslError,
    ServerError,
    #[serde(rename = "APIError")]
    ApiError,
    RequestException,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Success => "Success",
            TransactionStatus::Failure => "Failure",
            TransactionStatus::Dropped => "Dropped",
            TransactionStatus::Timeout => "Timeout",
            TransactionStatus::SslError => "SSLError",
            TransactionStatus::ServerError => "ServerError",
            TransactionStatus::ApiError => "APIError",
            TransactionStatus::RequestException => "RequestException",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billed object types a transaction can settle
pub const INVOICE_MODEL: &str = "billing.Invoice";

#[derive(Debug, Clone)]
pub struct TransactionCreateDBRequest {
    pub service_id: ServiceId,
    pub provider: String,
    pub wallet: String,
    pub phone: String,
    pub amount: Decimal,
    pub model: String,
    pub object_id: Uuid,
    pub callback: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionDBResponse {
    pub id: TransactionId,
    pub service_id: ServiceId,
    pub provider: String,
    pub wallet: String,
    pub phone: String,
    pub amount: Decimal,
    pub model: String,
    pub object_id: Uuid,
    pub processor_tx_id: Option<String>,
    pub task_id: Option<String>,
    pub callback: String,
    pub message: Option<String>,
    pub is_running: bool,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final state written when a transaction leaves the running state
#[derive(Debug, Clone)]
pub struct TransactionSettlement {
    pub status: TransactionStatus,
    pub processor_tx_id: Option<String>,
    pub message: Option<String>,
}
