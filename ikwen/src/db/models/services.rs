//! Database models for services (tenants) and their settings.

use crate::billing::cycle::BillingCycle;
use crate::types::{MemberId, ServiceId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Commercial version of a hosted service
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "service_version", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceVersion {
    Free,
    Trial,
    Full,
}

/// Lifecycle of a hosted service
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "service_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Active,
    Suspended,
    Canceled,
}

/// How a tenant delivers SMS
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "sms_sending_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SmsSendingMethod {
    /// SMS are not sent
    None,
    /// A GET on the tenant's gateway URL template
    HttpApi,
    /// Stored in `queued_sms` for an external sender
    Queue,
}

/// Database request for creating a service
#[derive(Debug, Clone)]
pub struct ServiceCreateDBRequest {
    pub member_id: MemberId,
    pub project_name: String,
    pub project_name_slug: String,
    pub database: String,
    pub domain: String,
    pub url: String,
    pub api_signature: String,
    pub billing_cycle: BillingCycle,
    pub version: ServiceVersion,
    pub status: ServiceStatus,
    pub monthly_cost: Decimal,
    pub expiry: Option<NaiveDate>,
    pub company_name: String,
    pub contact_email: Option<String>,
}

/// Database request for updating a service
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdateDBRequest {
    pub project_name: Option<String>,
    pub domain: Option<String>,
    pub url: Option<String>,
    pub billing_cycle: Option<BillingCycle>,
    pub version: Option<ServiceVersion>,
    pub status: Option<ServiceStatus>,
    pub monthly_cost: Option<Decimal>,
    pub expiry: Option<NaiveDate>,
}

/// Database response for a service
#[derive(Debug, Clone, FromRow)]
pub struct ServiceDBResponse {
    pub id: ServiceId,
    pub member_id: MemberId,
    pub project_name: String,
    pub project_name_slug: String,
    pub database: String,
    pub domain: String,
    pub url: String,
    pub api_signature: String,
    pub billing_cycle: BillingCycle,
    pub version: ServiceVersion,
    pub status: ServiceStatus,
    pub monthly_cost: Decimal,
    pub expiry: Option<NaiveDate>,
    pub since: DateTime<Utc>,
}

/// Tenant settings, one row per service
#[derive(Debug, Clone, FromRow)]
pub struct ConfigDBResponse {
    pub service_id: ServiceId,
    pub company_name: String,
    pub contact_email: Option<String>,
    pub currency_code: String,
    pub currency_symbol: String,
    pub decimal_precision: i16,
    pub sms_sending_method: SmsSendingMethod,
    pub sms_api_script_url: Option<String>,
    pub sms_label: Option<String>,
    pub register_with_email: bool,
    pub signature: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdateDBRequest {
    pub company_name: Option<String>,
    pub contact_email: Option<String>,
    pub currency_code: Option<String>,
    pub currency_symbol: Option<String>,
    pub decimal_precision: Option<i16>,
    pub sms_sending_method: Option<SmsSendingMethod>,
    pub sms_api_script_url: Option<String>,
    pub sms_label: Option<String>,
    pub register_with_email: Option<bool>,
    pub signature: Option<String>,
}

/// Invoicing settings, one row per service. Delays are in days.
#[derive(Debug, Clone, FromRow)]
pub struct InvoicingConfigDBResponse {
    pub service_id: ServiceId,
    /// Invoices are issued this many days before expiry
    pub gap: i32,
    /// Days after the due date before the service is suspended
    pub tolerance: i32,
    pub reminder_delay: i32,
    pub overdue_delay: i32,
    pub separate_billing_cycle: bool,
    pub processing_fees_on_customer: bool,
    pub new_invoice_subject: String,
    pub new_invoice_message: String,
    pub reminder_subject: String,
    pub reminder_message: String,
    pub overdue_subject: String,
    pub overdue_message: String,
    pub payment_confirmation_subject: String,
    pub payment_confirmation_message: String,
    pub service_suspension_subject: String,
    pub service_suspension_message: String,
    /// The tenant's platform pulls its invoices, the daily job does not issue them
    pub pull_invoice: bool,
    /// Hit when a subscription is suspended, empty for none
    pub suspension_return_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct InvoicingConfigUpdateDBRequest {
    pub gap: Option<i32>,
    pub tolerance: Option<i32>,
    pub reminder_delay: Option<i32>,
    pub overdue_delay: Option<i32>,
    pub separate_billing_cycle: Option<bool>,
    pub processing_fees_on_customer: Option<bool>,
    pub new_invoice_subject: Option<String>,
    pub new_invoice_message: Option<String>,
    pub reminder_subject: Option<String>,
    pub reminder_message: Option<String>,
    pub overdue_subject: Option<String>,
    pub overdue_message: Option<String>,
    pub payment_confirmation_subject: Option<String>,
    pub payment_confirmation_message: Option<String>,
    pub service_suspension_subject: Option<String>,
    pub service_suspension_message: Option<String>,
    pub pull_invoice: Option<bool>,
    pub suspension_return_url: Option<String>,
}
