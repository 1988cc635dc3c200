//! API request/response models for services (tenants), their settings and console events.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::pagination::Pagination;
use crate::billing::cycle::BillingCycle;
use crate::db::handlers::repository::ListQuery;
use crate::db::models::events::{ConsoleEventDBResponse, SendingReportDBResponse};
use crate::db::models::services::{
    ConfigDBResponse, ConfigUpdateDBRequest, InvoicingConfigDBResponse, InvoicingConfigUpdateDBRequest, ServiceDBResponse,
    ServiceStatus, ServiceVersion, SmsSendingMethod,
};
use crate::types::{MemberId, ServiceId};

/// Request body for creating a service. The owner becomes its IAO.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceCreate {
    #[schema(value_type = String, format = "uuid")]
    pub owner_id: MemberId,
    #[schema(example = "Boutique Mado")]
    pub project_name: String,
    /// Defaults to `{slug}.ikwen.com`
    pub domain: Option<String>,
    /// Database alias the tenant's data lives in. Defaults to `default`.
    pub database: Option<String>,
    #[serde(default = "default_billing_cycle")]
    pub billing_cycle: BillingCycle,
    #[serde(default = "default_version")]
    pub version: ServiceVersion,
    #[schema(value_type = String)]
    #[serde(default)]
    pub monthly_cost: Decimal,
    pub expiry: Option<NaiveDate>,
    /// Defaults to the project name
    pub company_name: Option<String>,
    pub contact_email: Option<String>,
}

fn default_billing_cycle() -> BillingCycle {
    BillingCycle::Monthly
}

fn default_version() -> ServiceVersion {
    ServiceVersion::Trial
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ServiceUpdate {
    pub project_name: Option<String>,
    pub domain: Option<String>,
    pub billing_cycle: Option<BillingCycle>,
    pub version: Option<ServiceVersion>,
    pub status: Option<ServiceStatus>,
    #[schema(value_type = Option<String>)]
    pub monthly_cost: Option<Decimal>,
    pub expiry: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ServiceId,
    #[schema(value_type = String, format = "uuid")]
    pub owner_id: MemberId,
    pub project_name: String,
    pub project_name_slug: String,
    pub database: String,
    pub domain: String,
    pub url: String,
    pub billing_cycle: BillingCycle,
    pub version: ServiceVersion,
    pub status: ServiceStatus,
    #[schema(value_type = String)]
    pub monthly_cost: Decimal,
    pub expiry: Option<NaiveDate>,
    pub since: DateTime<Utc>,
}

impl From<ServiceDBResponse> for ServiceResponse {
    fn from(service: ServiceDBResponse) -> Self {
        Self {
            id: service.id,
            owner_id: service.member_id,
            project_name: service.project_name,
            project_name_slug: service.project_name_slug,
            database: service.database,
            domain: service.domain,
            url: service.url,
            billing_cycle: service.billing_cycle,
            version: service.version,
            status: service.status,
            monthly_cost: service.monthly_cost,
            expiry: service.expiry,
            since: service.since,
        }
    }
}

/// Query parameters for listing services
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListServicesQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the project name
    pub q: Option<String>,

    pub status: Option<ServiceStatus>,

    /// Only services owned by this member
    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub owner_id: Option<MemberId>,
}

impl ListServicesQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfigResponse {
    pub company_name: String,
    pub contact_email: Option<String>,
    pub currency_code: String,
    pub currency_symbol: String,
    pub decimal_precision: i16,
    pub sms_sending_method: SmsSendingMethod,
    /// URL template with `$label`, `$recipient` and `$text`
    pub sms_api_script_url: Option<String>,
    pub sms_label: Option<String>,
    /// Registration requires an email address
    pub register_with_email: bool,
    /// HTML signature appended to tenant mails
    pub signature: String,
    pub updated_at: DateTime<Utc>,
}

impl From<ConfigDBResponse> for ConfigResponse {
    fn from(config: ConfigDBResponse) -> Self {
        Self {
            company_name: config.company_name,
            contact_email: config.contact_email,
            currency_code: config.currency_code,
            currency_symbol: config.currency_symbol,
            decimal_precision: config.decimal_precision,
            sms_sending_method: config.sms_sending_method,
            sms_api_script_url: config.sms_api_script_url,
            sms_label: config.sms_label,
            register_with_email: config.register_with_email,
            signature: config.signature,
            updated_at: config.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ConfigUpdate {
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

impl From<ConfigUpdate> for ConfigUpdateDBRequest {
    fn from(update: ConfigUpdate) -> Self {
        Self {
            company_name: update.company_name,
            contact_email: update.contact_email,
            currency_code: update.currency_code.map(|c| c.trim().to_uppercase()),
            currency_symbol: update.currency_symbol,
            decimal_precision: update.decimal_precision,
            sms_sending_method: update.sms_sending_method,
            sms_api_script_url: update.sms_api_script_url,
            sms_label: update.sms_label,
            register_with_email: update.register_with_email,
            signature: update.signature,
        }
    }
}

/// Invoicing settings. Delays are in days.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoicingConfigResponse {
    /// Invoices are issued this many days before expiry
    pub gap: i32,
    /// Days past the due date before the service is suspended
    pub tolerance: i32,
    pub reminder_delay: i32,
    pub overdue_delay: i32,
    /// Bill `monthly_cost × months(cycle)` instead of the product cost
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
    /// Invoices are pulled by the tenant's platform instead of issued daily
    pub pull_invoice: bool,
    /// Called with GET (`reference_id`, `invoice_number`) when a subscription is suspended
    pub suspension_return_url: String,
}

impl From<InvoicingConfigDBResponse> for InvoicingConfigResponse {
    fn from(config: InvoicingConfigDBResponse) -> Self {
        Self {
            gap: config.gap,
            tolerance: config.tolerance,
            reminder_delay: config.reminder_delay,
            overdue_delay: config.overdue_delay,
            separate_billing_cycle: config.separate_billing_cycle,
            processing_fees_on_customer: config.processing_fees_on_customer,
            new_invoice_subject: config.new_invoice_subject,
            new_invoice_message: config.new_invoice_message,
            reminder_subject: config.reminder_subject,
            reminder_message: config.reminder_message,
            overdue_subject: config.overdue_subject,
            overdue_message: config.overdue_message,
            payment_confirmation_subject: config.payment_confirmation_subject,
            payment_confirmation_message: config.payment_confirmation_message,
            service_suspension_subject: config.service_suspension_subject,
            service_suspension_message: config.service_suspension_message,
            pull_invoice: config.pull_invoice,
            suspension_return_url: config.suspension_return_url,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InvoicingConfigUpdate {
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

impl InvoicingConfigUpdate {
    /// Delays must be positive, the gap and tolerance may be zero
    pub fn validate(&self) -> Result<(), String> {
        for (name, value, min) in [
            ("gap", self.gap, 0),
            ("tolerance", self.tolerance, 0),
            ("reminder_delay", self.reminder_delay, 1),
            ("overdue_delay", self.overdue_delay, 1),
        ] {
            if let Some(value) = value
                && value < min
            {
                return Err(format!("{name} must be at least {min}"));
            }
        }
        if let Some(url) = self.suspension_return_url.as_deref()
            && !url.is_empty()
            && url::Url::parse(url).is_err()
        {
            return Err(format!("'{url}' is not a valid suspension return URL"));
        }
        Ok(())
    }
}

impl From<InvoicingConfigUpdate> for InvoicingConfigUpdateDBRequest {
    fn from(update: InvoicingConfigUpdate) -> Self {
        Self {
            gap: update.gap,
            tolerance: update.tolerance,
            reminder_delay: update.reminder_delay,
            overdue_delay: update.overdue_delay,
            separate_billing_cycle: update.separate_billing_cycle,
            processing_fees_on_customer: update.processing_fees_on_customer,
            new_invoice_subject: update.new_invoice_subject,
            new_invoice_message: update.new_invoice_message,
            reminder_subject: update.reminder_subject,
            reminder_message: update.reminder_message,
            overdue_subject: update.overdue_subject,
            overdue_message: update.overdue_message,
            payment_confirmation_subject: update.payment_confirmation_subject,
            payment_confirmation_message: update.payment_confirmation_message,
            service_suspension_subject: update.service_suspension_subject,
            service_suspension_message: update.service_suspension_message,
            pull_invoice: update.pull_invoice,
            suspension_return_url: update.suspension_return_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EventResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    #[schema(value_type = String, format = "uuid")]
    pub service_id: ServiceId,
    pub event_type: String,
    /// Invoice, payment or member the event is about
    #[schema(value_type = Option<String>, format = "uuid")]
    pub object_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<ConsoleEventDBResponse> for EventResponse {
    fn from(event: ConsoleEventDBResponse) -> Self {
        Self {
            id: event.id,
            service_id: event.service_id,
            event_type: event.event_type,
            object_id: event.object_id,
            created_at: event.created_at,
        }
    }
}

/// Query parameters for the console feed
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListEventsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Only events of this service
    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub service_id: Option<ServiceId>,
}

/// Summary of one batch of invoicing mails or a revival run
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendingReportResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    pub kind: String,
    pub count: i32,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<SendingReportDBResponse> for SendingReportResponse {
    fn from(report: SendingReportDBResponse) -> Self {
        Self {
            id: report.id,
            kind: report.kind,
            count: report.count,
            total_amount: report.total_amount,
            created_at: report.created_at,
        }
    }
}
