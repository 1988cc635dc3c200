//! API request/response models for products, subscriptions, invoices, payments and mobile money.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::pagination::Pagination;
use crate::billing::cycle::BillingCycle;
use crate::billing::payments::ManualInvoice;
use crate::billing::status::{InvoiceStatus, SubscriptionStatus};
use crate::db::handlers::repository::ListQuery;
use crate::db::models::invoices::{InvoiceDBResponse, InvoiceEntry};
use crate::db::models::mobile_money::{TransactionDBResponse, TransactionStatus};
use crate::db::models::payments::{PaymentDBResponse, PaymentMeanDBResponse, PaymentMethod};
use crate::db::models::products::{ProductDBResponse, ProductUpdateDBRequest};
use crate::db::models::subscriptions::SubscriptionDBResponse;
use crate::types::{InvoiceId, MemberId, PaymentId, PaymentMeanId, ProductId, ServiceId, SubscriptionId, TransactionId};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProductCreate {
    #[schema(example = "Premium plan")]
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    #[schema(value_type = String, example = "15000")]
    pub cost: Decimal,
    /// Days of service bought by one payment
    #[serde(default = "default_duration")]
    pub duration: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_duration() -> i32 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub short_description: Option<String>,
    #[schema(value_type = Option<String>)]
    pub cost: Option<Decimal>,
    pub duration: Option<i32>,
    pub is_active: Option<bool>,
}

impl From<ProductUpdate> for ProductUpdateDBRequest {
    fn from(update: ProductUpdate) -> Self {
        Self {
            name: update.name,
            short_description: update.short_description,
            cost: update.cost,
            duration: update.duration,
            is_active: update.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProductResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ProductId,
    pub name: String,
    pub short_description: String,
    #[schema(value_type = String)]
    pub cost: Decimal,
    pub duration: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ProductDBResponse> for ProductResponse {
    fn from(product: ProductDBResponse) -> Self {
        Self {
            id: product.id,
            name: product.name,
            short_description: product.short_description,
            cost: product.cost,
            duration: product.duration,
            is_active: product.is_active,
            created_at: product.created_at,
        }
    }
}

/// Query parameters for listing products
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListProductsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the product name
    pub q: Option<String>,

    /// Only products that can be subscribed to
    #[serde(default)]
    pub active_only: bool,
}

impl ListProductsQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// Request body for subscribing a member. The cost defaults to the product's.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionCreate {
    #[schema(value_type = String, format = "uuid")]
    pub member_id: MemberId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub product_id: Option<ProductId>,
    #[schema(value_type = Option<String>)]
    pub monthly_cost: Option<Decimal>,
    #[serde(default = "default_billing_cycle")]
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub details: String,
    /// Paid-until date. Subscriptions without one get their first invoice on the next run.
    pub expiry: Option<NaiveDate>,
    /// Days of grace after the due date. Defaults to the service's tolerance.
    pub invoice_tolerance: Option<i32>,
}

fn default_billing_cycle() -> BillingCycle {
    BillingCycle::Monthly
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: SubscriptionId,
    #[schema(value_type = String, format = "uuid")]
    pub member_id: MemberId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub product_id: Option<ProductId>,
    #[schema(value_type = String)]
    pub monthly_cost: Decimal,
    pub billing_cycle: BillingCycle,
    pub details: String,
    pub expiry: Option<NaiveDate>,
    pub invoice_tolerance: i32,
    pub status: SubscriptionStatus,
    pub since: DateTime<Utc>,
}

impl From<SubscriptionDBResponse> for SubscriptionResponse {
    fn from(subscription: SubscriptionDBResponse) -> Self {
        Self {
            id: subscription.id,
            member_id: subscription.member_id,
            product_id: subscription.product_id,
            monthly_cost: subscription.monthly_cost,
            billing_cycle: subscription.billing_cycle,
            details: subscription.details,
            expiry: subscription.expiry,
            invoice_tolerance: subscription.invoice_tolerance,
            status: subscription.status,
            since: subscription.since,
        }
    }
}

/// Query parameters for listing subscriptions
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListSubscriptionsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the subscription details
    pub q: Option<String>,

    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub member_id: Option<MemberId>,

    pub status: Option<SubscriptionStatus>,
}

impl ListSubscriptionsQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BillingCycleChange {
    pub billing_cycle: BillingCycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionStatusChange {
    pub status: SubscriptionStatus,
}

/// Request body for an invoice issued by staff
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceCreate {
    #[schema(value_type = String, format = "uuid")]
    pub subscription_id: SubscriptionId,
    /// Defaults to the monthly cost times `months_count`
    #[schema(value_type = Option<String>)]
    pub amount: Option<Decimal>,
    #[serde(default = "default_months")]
    pub months_count: i32,
    pub due_date: NaiveDate,
    /// A one-off invoice upgrades the service to its full version once paid
    #[serde(default)]
    pub is_one_off: bool,
    #[serde(default)]
    pub entries: Vec<InvoiceEntry>,
}

fn default_months() -> i32 {
    1
}

impl From<InvoiceCreate> for ManualInvoice {
    fn from(create: InvoiceCreate) -> Self {
        Self {
            subscription_id: create.subscription_id,
            amount: create.amount,
            months_count: create.months_count,
            due_date: create.due_date,
            is_one_off: create.is_one_off,
            entries: create.entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: InvoiceId,
    #[schema(value_type = String, format = "uuid")]
    pub subscription_id: SubscriptionId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub member_id: Option<MemberId>,
    pub number: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    #[schema(value_type = String)]
    pub paid: Decimal,
    #[schema(value_type = String)]
    pub balance_due: Decimal,
    #[schema(value_type = String)]
    pub processing_fees: Decimal,
    pub months_count: i32,
    pub date_issued: DateTime<Utc>,
    pub due_date: NaiveDate,
    pub reminders_sent: i32,
    pub overdue_notices_sent: i32,
    pub status: InvoiceStatus,
    pub is_one_off: bool,
    pub entries: Vec<InvoiceEntry>,
}

impl From<InvoiceDBResponse> for InvoiceResponse {
    fn from(invoice: InvoiceDBResponse) -> Self {
        let balance_due = invoice.balance_due();
        Self {
            id: invoice.id,
            subscription_id: invoice.subscription_id,
            member_id: invoice.member_id,
            number: invoice.number,
            amount: invoice.amount,
            paid: invoice.paid,
            balance_due,
            processing_fees: invoice.processing_fees,
            months_count: invoice.months_count,
            date_issued: invoice.date_issued,
            due_date: invoice.due_date,
            reminders_sent: invoice.reminders_sent,
            overdue_notices_sent: invoice.overdue_notices_sent,
            status: invoice.status,
            is_one_off: invoice.is_one_off,
            entries: invoice.entries.0,
        }
    }
}

/// Query parameters for listing invoices
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListInvoicesQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the invoice number
    pub q: Option<String>,

    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub member_id: Option<MemberId>,

    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub subscription_id: Option<SubscriptionId>,

    pub status: Option<InvoiceStatus>,
}

impl ListInvoicesQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// A payment collected at the counter
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentCreate {
    #[schema(value_type = String, example = "5000")]
    pub amount: Decimal,
    #[serde(default = "default_method")]
    pub method: PaymentMethod,
}

fn default_method() -> PaymentMethod {
    PaymentMethod::Cash
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: PaymentId,
    #[schema(value_type = String, format = "uuid")]
    pub invoice_id: InvoiceId,
    pub method: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub cashier_id: Option<MemberId>,
    pub processor_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentDBResponse> for PaymentResponse {
    fn from(payment: PaymentDBResponse) -> Self {
        Self {
            id: payment.id,
            invoice_id: payment.invoice_id,
            method: payment.method,
            amount: payment.amount,
            cashier_id: payment.cashier_id,
            processor_tx_id: payment.processor_tx_id,
            created_at: payment.created_at,
        }
    }
}

/// Invoice after a counter payment, with the recorded payment
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentReceipt {
    pub invoice: InvoiceResponse,
    pub payment: PaymentResponse,
}

/// A payment mean. Credentials are write-only and never returned.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentMeanResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: PaymentMeanId,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    /// Whether credentials were set
    pub configured: bool,
}

impl From<PaymentMeanDBResponse> for PaymentMeanResponse {
    fn from(mean: PaymentMeanDBResponse) -> Self {
        let configured = mean.credentials.0.as_object().is_some_and(|o| !o.is_empty());
        Self {
            id: mean.id,
            name: mean.name,
            slug: mean.slug,
            is_active: mean.is_active,
            configured,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentMeanCreate {
    #[schema(example = "MTN Mobile Money")]
    pub name: String,
    /// `mtn-momo` and `orange-money` are collected through their operator APIs
    #[schema(example = "mtn-momo")]
    pub slug: String,
    #[schema(value_type = Object)]
    #[serde(default = "empty_credentials")]
    pub credentials: serde_json::Value,
    /// Means start disabled until their credentials are checked
    #[serde(default)]
    pub is_active: bool,
}

fn empty_credentials() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentMeanCredentials {
    /// Provider account settings, e.g. `api_user`, `api_key` and `subscription_key` for MTN
    #[schema(value_type = Object)]
    pub credentials: serde_json::Value,
}

/// Query parameters for listing payment means
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListPaymentMeansQuery {
    #[serde(default)]
    pub active_only: bool,
}

/// Request body for paying an invoice from a mobile money account
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MobileMoneyPaymentCreate {
    #[schema(value_type = String, format = "uuid")]
    pub invoice_id: InvoiceId,
    /// Payment mean slug: `mtn-momo`, `orange-money` or `dummy`
    #[schema(example = "mtn-momo")]
    pub provider: String,
    #[schema(example = "677000000")]
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TransactionId,
    #[schema(value_type = String, format = "uuid")]
    pub service_id: ServiceId,
    pub provider: String,
    pub phone: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub model: String,
    #[schema(value_type = String, format = "uuid")]
    pub object_id: Uuid,
    pub processor_tx_id: Option<String>,
    pub message: Option<String>,
    pub is_running: bool,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TransactionDBResponse> for TransactionResponse {
    fn from(tx: TransactionDBResponse) -> Self {
        Self {
            id: tx.id,
            service_id: tx.service_id,
            provider: tx.provider,
            phone: tx.phone,
            amount: tx.amount,
            model: tx.model,
            object_id: tx.object_id,
            processor_tx_id: tx.processor_tx_id,
            message: tx.message,
            is_running: tx.is_running,
            status: tx.status,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

/// Query string of provider notifications
#[derive(Debug, Deserialize, IntoParams)]
pub struct NotificationQuery {
    /// HMAC of the transaction id, part of the notification URL handed to the provider
    pub signature: String,
}
