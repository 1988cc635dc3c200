//! Database models for products.

use crate::types::{ProductId, ServiceId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(Debug, Clone)]
pub struct ProductCreateDBRequest {
    pub service_id: ServiceId,
    pub name: String,
    pub short_description: String,
    pub cost: Decimal,
    /// Days of service bought by one payment
    pub duration: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProductUpdateDBRequest {
    pub name: Option<String>,
    pub short_description: Option<String>,
    pub cost: Option<Decimal>,
    pub duration: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProductDBResponse {
    pub id: ProductId,
    pub service_id: ServiceId,
    pub name: String,
    pub short_description: String,
    pub cost: Decimal,
    pub duration: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
