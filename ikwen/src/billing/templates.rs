//! Billing notices.
//!
//! Tenants write their own subjects and messages in the invoicing config. Messages may carry
//! `$member_name`, `$company_name`, `$invoice_number`, `$amount`, `$date_issued`, `$due_date` and
//! `$invoice_description`. Empty templates fall back to built-in wording.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::db::models::invoices::InvoiceDBResponse;
use crate::db::models::products::ProductDBResponse;
use crate::db::models::services::{ConfigDBResponse, InvoicingConfigDBResponse};
use crate::db::models::subscriptions::SubscriptionDBResponse;
use crate::email::escape;

const DATE_FORMAT: &str = "%B %d, %Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NewInvoice,
    Reminder,
    /// Carries the number of overdue notices already sent
    Overdue(i32),
    PaymentConfirmation,
    ServiceSuspension,
}

impl Notice {
    fn default_subject(self) -> &'static str {
        match self {
            Notice::NewInvoice => "Customer Invoice",
            Notice::Reminder => "Invoice Reminder",
            Notice::Overdue(_) => "Overdue Invoice",
            Notice::PaymentConfirmation => "Payment Confirmation",
            Notice::ServiceSuspension => "Service Suspended",
        }
    }

    fn configured(self, config: &InvoicingConfigDBResponse) -> (&str, &str) {
        match self {
            Notice::NewInvoice => (&config.new_invoice_subject, &config.new_invoice_message),
            Notice::Reminder => (&config.reminder_subject, &config.reminder_message),
            Notice::Overdue(_) => (&config.overdue_subject, &config.overdue_message),
            Notice::PaymentConfirmation => (&config.payment_confirmation_subject, &config.payment_confirmation_message),
            Notice::ServiceSuspension => (&config.service_suspension_subject, &config.service_suspension_message),
        }
    }
}

/// Values substituted into a notice
#[derive(Debug, Clone)]
pub struct InvoiceContext {
    pub member_name: String,
    pub company_name: String,
    pub invoice_number: String,
    pub amount: String,
    pub date_issued: String,
    pub due_date: String,
    pub invoice_description: String,
}

impl InvoiceContext {
    pub fn new(invoice: &InvoiceDBResponse, member_name: &str, description: &str, config: &ConfigDBResponse) -> Self {
        Self {
            member_name: member_name.to_string(),
            company_name: config.company_name.clone(),
            invoice_number: invoice.number.clone(),
            amount: format_amount(invoice.amount, config),
            date_issued: invoice.date_issued.format(DATE_FORMAT).to_string(),
            due_date: format_date(invoice.due_date),
            invoice_description: description.to_string(),
        }
    }

    fn escaped(&self) -> Self {
        Self {
            member_name: escape(&self.member_name),
            company_name: escape(&self.company_name),
            invoice_number: escape(&self.invoice_number),
            amount: escape(&self.amount),
            date_issued: escape(&self.date_issued),
            due_date: escape(&self.due_date),
            invoice_description: escape(&self.invoice_description),
        }
    }
}

/// Amount rounded to the tenant's precision, followed by its currency code
pub fn format_amount(amount: Decimal, config: &ConfigDBResponse) -> String {
    let precision = u32::try_from(config.decimal_precision).unwrap_or(0);
    format!("{} {}", amount.round_dp(precision).normalize(), config.currency_code)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Replace every placeholder of `template`
pub fn substitute(template: &str, context: &InvoiceContext) -> String {
    template
        .replace("$member_name", &context.member_name)
        .replace("$company_name", &context.company_name)
        .replace("$invoice_number", &context.invoice_number)
        .replace("$amount", &context.amount)
        .replace("$date_issued", &context.date_issued)
        .replace("$due_date", &context.due_date)
        .replace("$invoice_description", &context.invoice_description)
}

fn default_message(notice: Notice, context: &InvoiceContext) -> String {
    match notice {
        Notice::NewInvoice => format!(
            "<p>Dear {},</p><p>This is a notice that invoice No. {} of {} has been generated on {}. It is due on {}.</p><p>{}</p>",
            context.member_name, context.invoice_number, context.amount, context.date_issued, context.due_date, context.invoice_description
        ),
        Notice::Reminder => format!(
            "<p>Dear {},</p><p>This is a billing reminder that your invoice No. {} which was generated on {} is due on {}.</p>",
            context.member_name, context.invoice_number, context.date_issued, context.due_date
        ),
        Notice::Overdue(_) => format!(
            "<p>Dear {},</p><p>This is a billing reminder that your invoice No. {} which was due on {} is now overdue.</p>",
            context.member_name, context.invoice_number, context.due_date
        ),
        Notice::PaymentConfirmation => format!(
            "<p>Dear {},</p><p>We received your payment of {} for invoice No. {}. Thank you for your business with {}.</p>",
            context.member_name, context.amount, context.invoice_number, context.company_name
        ),
        Notice::ServiceSuspension => format!(
            "<p>Dear {},</p><p>This is a notice of <strong>service suspension</strong> because of unpaid invoice \
             <strong>No. {}</strong> generated on {} and due on {}.</p>",
            context.member_name, context.invoice_number, context.date_issued, context.due_date
        ),
    }
}

/// Subject and HTML body of a notice. Tenant templates are trusted HTML, substituted values are
/// escaped.
pub fn render_notice(notice: Notice, config: &InvoicingConfigDBResponse, context: &InvoiceContext) -> (String, String) {
    let (subject, message) = notice.configured(config);
    let base_subject = if subject.trim().is_empty() {
        notice.default_subject()
    } else {
        subject.trim()
    };
    let subject = match notice {
        Notice::Overdue(0) => format!("First notice: {base_subject}"),
        Notice::Overdue(1) => format!("Second notice: {base_subject}"),
        Notice::Overdue(_) => format!("Third and last notice: {base_subject}"),
        _ => base_subject.to_string(),
    };
    let context = context.escaped();
    let body = if message.trim().is_empty() {
        default_message(notice, &context)
    } else {
        substitute(message, &context)
    };
    (subject, body)
}

/// Subject, HTML body and SMS text telling a member their subscription is active
pub fn render_subscription_activated(
    subscription: &SubscriptionDBResponse,
    product: Option<&ProductDBResponse>,
    member_name: &str,
    config: &ConfigDBResponse,
) -> (String, String, String) {
    let name = product.map_or(subscription.details.as_str(), |p| p.name.as_str());
    let summary = match product.map(|p| p.short_description.trim()).filter(|d| !d.is_empty()) {
        Some(description) => format!("<strong>{}</strong> ({})", escape(name), escape(description)),
        None => format!("<strong>{}</strong>", escape(name)),
    };
    let cost = format_amount(subscription.monthly_cost, config);
    let body = format!(
        "<p>Dear {},</p><p>Your subscription to {summary} is confirmed. See details below:</p>\
         <p>{}<br>Monthly cost: <strong>{}</strong><br>Billing cycle: {}</p><p>Thank you for your business with {}.</p>",
        escape(member_name),
        escape(&subscription.details),
        escape(&cost),
        subscription.billing_cycle,
        escape(&config.company_name),
    );
    let sms = format!("{}: your subscription to {name} is active, {cost} a month.", config.company_name);
    ("Subscription activated".to_string(), body, sms)
}

/// Plain-text SMS version of a notice
pub fn render_sms(notice: Notice, context: &InvoiceContext) -> String {
    match notice {
        Notice::NewInvoice => format!(
            "{}: invoice {} of {} is due on {}.",
            context.company_name, context.invoice_number, context.amount, context.due_date
        ),
        Notice::Reminder => format!(
            "{}: reminder, invoice {} of {} is due on {}.",
            context.company_name, context.invoice_number, context.amount, context.due_date
        ),
        Notice::Overdue(_) => format!(
            "{}: invoice {} of {} was due on {} and is now overdue.",
            context.company_name, context.invoice_number, context.amount, context.due_date
        ),
        Notice::PaymentConfirmation => format!(
            "{}: payment of {} received for invoice {}. Thank you.",
            context.company_name, context.amount, context.invoice_number
        ),
        Notice::ServiceSuspension => format!(
            "{}: your service is suspended because invoice {} is unpaid.",
            context.company_name, context.invoice_number
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::services::SmsSendingMethod;
    use chrono::Utc;
    use uuid::Uuid;

    fn invoicing_config() -> InvoicingConfigDBResponse {
        InvoicingConfigDBResponse {
            service_id: Uuid::new_v4(),
            gap: 15,
            tolerance: 1,
            reminder_delay: 5,
            overdue_delay: 2,
            separate_billing_cycle: false,
            processing_fees_on_customer: false,
            new_invoice_subject: String::new(),
            new_invoice_message: String::new(),
            reminder_subject: "Pay up".to_string(),
            reminder_message: "Hi $member_name, invoice $invoice_number ($amount) from $company_name is due on $due_date."
                .to_string(),
            overdue_subject: String::new(),
            overdue_message: String::new(),
            payment_confirmation_subject: String::new(),
            payment_confirmation_message: String::new(),
            service_suspension_subject: String::new(),
            service_suspension_message: String::new(),
            pull_invoice: false,
            suspension_return_url: String::new(),
        }
    }

    fn context() -> InvoiceContext {
        InvoiceContext {
            member_name: "Roger".to_string(),
            company_name: "Acme & Co".to_string(),
            invoice_number: "A12/0324".to_string(),
            amount: "5000 XAF".to_string(),
            date_issued: "March 01, 2024".to_string(),
            due_date: "March 16, 2024".to_string(),
            invoice_description: "Hosting".to_string(),
        }
    }

    #[test]
    fn test_substitute_every_placeholder() {
        let text = substitute(
            "$member_name|$company_name|$invoice_number|$amount|$date_issued|$due_date|$invoice_description",
            &context(),
        );
        assert_eq!(text, "Roger|Acme & Co|A12/0324|5000 XAF|March 01, 2024|March 16, 2024|Hosting");
    }

    #[test]
    fn test_configured_template_is_used_and_escaped() {
        let (subject, body) = render_notice(Notice::Reminder, &invoicing_config(), &context());
        assert_eq!(subject, "Pay up");
        assert_eq!(body, "Hi Roger, invoice A12/0324 (5000 XAF) from Acme &amp; Co is due on March 16, 2024.");
    }

    #[test]
    fn test_default_subjects() {
        let config = invoicing_config();
        assert_eq!(render_notice(Notice::NewInvoice, &config, &context()).0, "Customer Invoice");
        assert_eq!(render_notice(Notice::PaymentConfirmation, &config, &context()).0, "Payment Confirmation");
        assert_eq!(render_notice(Notice::ServiceSuspension, &config, &context()).0, "Service Suspended");
        assert_eq!(render_notice(Notice::Overdue(0), &config, &context()).0, "First notice: Overdue Invoice");
        assert_eq!(render_notice(Notice::Overdue(2), &config, &context()).0, "Third and last notice: Overdue Invoice");
    }

    fn tenant_config() -> ConfigDBResponse {
        ConfigDBResponse {
            service_id: Uuid::new_v4(),
            company_name: "Acme".to_string(),
            contact_email: None,
            currency_code: "XAF".to_string(),
            currency_symbol: "XAF".to_string(),
            decimal_precision: 0,
            sms_sending_method: SmsSendingMethod::None,
            sms_api_script_url: None,
            sms_label: None,
            register_with_email: false,
            signature: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_subscription_activated_notice() {
        let subscription = SubscriptionDBResponse {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            product_id: None,
            monthly_cost: Decimal::from(5000),
            billing_cycle: crate::billing::cycle::BillingCycle::Quarterly,
            details: "Hosting <10 GB>".to_string(),
            expiry: None,
            invoice_tolerance: 1,
            status: crate::billing::status::SubscriptionStatus::Active,
            since: Utc::now(),
            updated_at: Utc::now(),
        };
        let (subject, body, sms) = render_subscription_activated(&subscription, None, "Roger", &tenant_config());
        assert_eq!(subject, "Subscription activated");
        assert!(body.contains("Dear Roger"));
        assert!(body.contains("<strong>Hosting &lt;10 GB&gt;</strong>"));
        assert!(body.contains("Monthly cost: <strong>5000 XAF</strong>"));
        assert!(body.contains("Billing cycle: quarterly"));
        assert_eq!(sms, "Acme: your subscription to Hosting <10 GB> is active, 5000 XAF a month.");
    }

    #[test]
    fn test_amount_uses_tenant_precision() {
        let config = tenant_config();
        assert_eq!(format_amount(Decimal::new(1500000, 2), &config), "15000 XAF");
        let euros = ConfigDBResponse {
            currency_code: "EUR".to_string(),
            decimal_precision: 2,
            ..config
        };
        assert_eq!(format_amount(Decimal::new(125, 1), &euros), "12.5 EUR");
    }
}
