//! Daily invoicing jobs.
//!
//! For every active tenant, in order: issue invoices for subscriptions about to expire, remind
//! customers of pending invoices, send overdue notices, and suspend subscriptions whose invoice
//! stayed unpaid past the tolerance. Every job takes `now` so runs are reproducible. A failure on
//! one invoice is logged and counted in the [`JobReport`], the batch carries on.
//!
//! A notice is recorded on the invoice whether or not the mail went out, so one failed delivery
//! does not stall the reminder schedule.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::billing::{
    numbering::{NumberPrefix, next_invoice_number},
    payments::Payer,
    status::{InvoiceStatus, SubscriptionStatus},
    templates::{InvoiceContext, Notice, render_notice, render_sms},
};
use crate::db::{
    errors::DbError,
    handlers::{Events, Invoices, Members, OperatorWallets, Products, Repository, Services, Subscriptions},
    models::{
        events::{ConsoleEventCreateDBRequest, EventType},
        invoices::{InvoiceCreateDBRequest, InvoiceDBResponse, InvoiceEntry},
        services::{ConfigDBResponse, InvoicingConfigDBResponse, ServiceDBResponse},
        subscriptions::SubscriptionDBResponse,
    },
    router::DbRouter,
};
use crate::errors::Error;
use crate::notifier::{Delivery, Notifier, notify_for_messaging_credit};
use crate::types::{ServiceId, abbrev_uuid};

/// What a job did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct JobReport {
    /// Records acted upon
    pub processed: u32,
    /// Records for which at least one mail or SMS went out
    pub notified: u32,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub failures: u32,
}

impl JobReport {
    pub fn merge(&mut self, other: JobReport) {
        self.processed += other.processed;
        self.notified += other.notified;
        self.total_amount += other.total_amount;
        self.failures += other.failures;
    }

    fn count(&mut self, result: Result<Option<(Decimal, bool)>, Error>, number: &str) {
        match result {
            Ok(Some((amount, notified))) => {
                self.processed += 1;
                self.total_amount += amount;
                if notified {
                    self.notified += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(invoice = number, error = %e, "Invoicing job failed on record");
                self.failures += 1;
            }
        }
    }
}

/// Settings of the tenant being processed
struct Tenant {
    service: ServiceDBResponse,
    config: ConfigDBResponse,
    invoicing: InvoicingConfigDBResponse,
}

fn days_since(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    at.map(|at| (now - at).num_days())
}

/// Timeout of the call to a tenant's suspension return URL
const RETURN_URL_TIMEOUT: StdDuration = StdDuration::from_secs(15);

#[derive(Clone)]
pub struct Invoicing {
    db: DbRouter,
    notifier: Notifier,
    payer: Payer,
    client: reqwest::Client,
}

impl Invoicing {
    pub fn new(db: DbRouter, notifier: Notifier) -> Result<Self, Error> {
        let payer = Payer::new(db.clone(), notifier.clone());
        let client = reqwest::Client::builder()
            .timeout(RETURN_URL_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal {
                operation: format!("create invoicing HTTP client: {e}"),
            })?;
        Ok(Self { db, notifier, payer, client })
    }

    /// Run every job for every active tenant
    #[instrument(skip(self), err)]
    pub async fn run_daily(&self, now: DateTime<Utc>) -> Result<JobReport, Error> {
        let services = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Services::new(&mut conn).list_active().await?
        };

        let mut total = JobReport::default();
        for service in services {
            let jobs = [
                ("send_invoices", self.send_invoices(service.id, now).await),
                ("send_invoice_reminders", self.send_invoice_reminders(service.id, now).await),
                ("send_invoice_overdue_notices", self.send_invoice_overdue_notices(service.id, now).await),
                ("suspend_customers_services", self.suspend_customers_services(service.id, now).await),
            ];
            for (job, result) in jobs {
                match result {
                    Ok(report) => total.merge(report),
                    Err(e) => {
                        error!(job, service_id = %abbrev_uuid(&service.id), error = %e, "Invoicing job failed");
                        total.failures += 1;
                    }
                }
            }
        }
        info!(?total, "Daily invoicing done");
        Ok(total)
    }

    async fn tenant(&self, service_id: ServiceId) -> Result<Tenant, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut services = Services::new(&mut conn);
        let service = services.get_by_id(service_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Service".to_string(),
            id: service_id.to_string(),
        })?;
        let config = services.get_config(service_id).await?;
        let invoicing = services.get_invoicing_config(service_id).await?;
        Ok(Tenant { service, config, invoicing })
    }

    /// Issue invoices `gap` days before subscriptions expire
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn send_invoices(&self, service_id: ServiceId, now: DateTime<Utc>) -> Result<JobReport, Error> {
        let tenant = self.tenant(service_id).await?;
        if tenant.invoicing.pull_invoice {
            debug!("Tenant pulls its invoices");
            return Ok(JobReport::default());
        }
        let expiry = now.date_naive() + Duration::days(i64::from(tenant.invoicing.gap));
        let subscriptions = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Subscriptions::new(&mut conn).list_expiring_on(service_id, expiry).await?
        };
        debug!(count = subscriptions.len(), %expiry, "Subscriptions to invoice");

        let mut report = JobReport::default();
        for subscription in &subscriptions {
            let result = self.invoice_subscription(&tenant, subscription, expiry, now).await;
            report.count(result, &subscription.id.to_string());
        }
        self.record_report(&tenant, EventType::InvoicesSentEvent, &report, now).await?;
        Ok(report)
    }

    async fn invoice_subscription(
        &self,
        tenant: &Tenant,
        subscription: &SubscriptionDBResponse,
        due_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<(Decimal, bool)>, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        if Invoices::new(&mut conn).has_open_invoice(subscription.id).await? {
            debug!(subscription_id = %abbrev_uuid(&subscription.id), "Subscription already has an open invoice");
            return Ok(None);
        }

        let (amount, months_count, label) = if tenant.invoicing.separate_billing_cycle {
            let months = subscription.billing_cycle.months() as i32;
            (subscription.monthly_cost * Decimal::from(months), months, subscription.details.clone())
        } else {
            let product = match subscription.product_id {
                Some(product_id) => Products::new(&mut conn).get_by_id(product_id).await?,
                None => None,
            };
            match product {
                Some(product) => (product.cost, (product.duration / 30).max(1), product.name),
                None => (subscription.monthly_cost, 1, subscription.details.clone()),
            }
        };

        let number = next_invoice_number(&mut conn, tenant.service.id, NumberPrefix::Auto, now).await?;
        let invoice = Invoices::new(&mut conn)
            .create(&InvoiceCreateDBRequest {
                service_id: tenant.service.id,
                subscription_id: subscription.id,
                member_id: Some(subscription.member_id),
                number,
                amount,
                months_count,
                date_issued: now,
                due_date: subscription.expiry.unwrap_or(due_date),
                is_one_off: false,
                entries: vec![InvoiceEntry::new(label, 1, amount)],
            })
            .await?;

        let wallet_balance: Decimal = {
            let mut wallet_conn = self.db.wallets().acquire().await.map_err(DbError::from)?;
            let wallets = OperatorWallets::new(&mut wallet_conn).list(tenant.service.id).await?;
            wallets.iter().map(|w| w.balance).sum()
        };
        if wallet_balance > Decimal::ZERO && wallet_balance >= amount {
            self.payer.pay_with_wallet_balance(invoice.id, now).await?;
            return Ok(Some((amount, false)));
        }

        Invoices::new(&mut conn).record_reminder(invoice.id, now).await?;
        drop(conn);
        let notified = self.notify_logged(tenant, &invoice, Notice::NewInvoice).await;
        Ok(Some((amount, notified)))
    }

    /// Remind customers every `reminder_delay` days until the due date
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn send_invoice_reminders(&self, service_id: ServiceId, now: DateTime<Utc>) -> Result<JobReport, Error> {
        let tenant = self.tenant(service_id).await?;
        let invoices = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Invoices::new(&mut conn).list_reminder_candidates(service_id, now.date_naive()).await?
        };

        let mut report = JobReport::default();
        for invoice in invoices {
            if days_since(invoice.last_reminder, now) != Some(i64::from(tenant.invoicing.reminder_delay)) {
                continue;
            }
            let result = async {
                {
                    let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                    Invoices::new(&mut conn).record_reminder(invoice.id, now).await?;
                }
                let notified = self.notify_logged(&tenant, &invoice, Notice::Reminder).await;
                Ok::<_, Error>(Some((invoice.amount, notified)))
            }
            .await;
            report.count(result, &invoice.number);
        }
        self.record_report(&tenant, EventType::RemindersSentEvent, &report, now).await?;
        Ok(report)
    }

    /// Mark past-due invoices overdue and send up to three notices, `overdue_delay` days apart
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn send_invoice_overdue_notices(&self, service_id: ServiceId, now: DateTime<Utc>) -> Result<JobReport, Error> {
        let tenant = self.tenant(service_id).await?;
        let invoices = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Invoices::new(&mut conn).list_past_due(service_id, now.date_naive()).await?
        };

        let mut report = JobReport::default();
        for invoice in invoices {
            let due_for_notice = match days_since(invoice.last_overdue_notice, now) {
                None => true,
                Some(days) => days == i64::from(tenant.invoicing.overdue_delay),
            };
            if !due_for_notice {
                continue;
            }
            let result = async {
                let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                let invoice = if invoice.status == InvoiceStatus::Pending {
                    Invoices::new(&mut conn).transition(invoice.id, InvoiceStatus::Overdue).await?
                } else {
                    invoice.clone()
                };
                Invoices::new(&mut conn).record_overdue_notice(invoice.id, now).await?;
                drop(conn);
                let notified = self
                    .notify_logged(&tenant, &invoice, Notice::Overdue(invoice.overdue_notices_sent))
                    .await;
                Ok::<_, Error>(Some((invoice.amount, notified)))
            }
            .await;
            report.count(result, &invoice.number);
        }
        self.record_report(&tenant, EventType::OverdueNoticesSentEvent, &report, now).await?;
        Ok(report)
    }

    /// Suspend subscriptions whose invoice is still unpaid `tolerance` days after its due date
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn suspend_customers_services(&self, service_id: ServiceId, now: DateTime<Utc>) -> Result<JobReport, Error> {
        let tenant = self.tenant(service_id).await?;
        let deadline = now.date_naive() - Duration::days(i64::from(tenant.invoicing.tolerance));
        let invoices = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Invoices::new(&mut conn).list_overdue_before(service_id, deadline).await?
        };

        let mut report = JobReport::default();
        for invoice in invoices {
            let result = async {
                let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                let invoice = Invoices::new(&mut conn).transition(invoice.id, InvoiceStatus::Exceeded).await?;
                let mut subscriptions = Subscriptions::new(&mut conn);
                if let Some(subscription) = subscriptions.get_by_id(invoice.subscription_id).await?
                    && subscription.status == SubscriptionStatus::Active
                {
                    subscriptions.transition(subscription.id, SubscriptionStatus::Suspended).await?;
                }
                Events::new(&mut conn)
                    .create(&ConsoleEventCreateDBRequest {
                        service_id,
                        member_id: invoice.member_id,
                        event_type: EventType::ServiceSuspended,
                        object_id: Some(invoice.id),
                    })
                    .await?;
                drop(conn);
                self.call_suspension_return_url(&tenant, &invoice).await;
                let notified = self.notify_logged(&tenant, &invoice, Notice::ServiceSuspension).await;
                Ok::<_, Error>(Some((invoice.amount, notified)))
            }
            .await;
            report.count(result, &invoice.number);
        }
        self.record_report(&tenant, EventType::SuspensionNoticesSentEvent, &report, now).await?;
        Ok(report)
    }

    /// Tell the tenant's platform that a subscription was suspended. Failures are logged only.
    async fn call_suspension_return_url(&self, tenant: &Tenant, invoice: &InvoiceDBResponse) {
        let url = tenant.invoicing.suspension_return_url.trim();
        if url.is_empty() {
            return;
        }
        let reference_id = invoice.subscription_id.to_string();
        let result = self
            .client
            .get(url)
            .query(&[("reference_id", reference_id.as_str()), ("invoice_number", invoice.number.as_str())])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url, status = %response.status(), "Suspension return URL notified");
            }
            Ok(response) => warn!(url, status = %response.status(), "Suspension return URL rejected the notification"),
            Err(e) => warn!(url, error = %e, "Failed to call suspension return URL"),
        }
    }

    /// [`Self::notify`] for jobs that already recorded the notice. A delivery failure is logged.
    async fn notify_logged(&self, tenant: &Tenant, invoice: &InvoiceDBResponse, notice: Notice) -> bool {
        match self.notify(tenant, invoice, notice).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(invoice = %invoice.number, ?notice, error = %e, "Invoice notice not delivered");
                false
            }
        }
    }

    /// Mail and text the invoice's member. Returns whether anything went out.
    async fn notify(&self, tenant: &Tenant, invoice: &InvoiceDBResponse, notice: Notice) -> Result<bool, Error> {
        let Some(member_id) = invoice.member_id else {
            return Ok(false);
        };
        let (member, description) = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            let Some(member) = Members::new(&mut conn).get_by_id(member_id).await? else {
                return Ok(false);
            };
            let description = Subscriptions::new(&mut conn)
                .get_by_id(invoice.subscription_id)
                .await?
                .map(|s| s.details)
                .unwrap_or_default();
            (member, description)
        };

        let context = InvoiceContext::new(invoice, &member.first_name, &description, &tenant.config);
        let wallets = self.db.wallets();
        let mut sent = false;

        if let Some(email) = member.deliverable_email() {
            let (subject, message) = render_notice(notice, &tenant.invoicing, &context);
            let delivery = self
                .notifier
                .send_tenant_mail(&wallets, &tenant.config, email, Some(&member.first_name), &subject, &message)
                .await?;
            sent |= delivery == Delivery::Sent;
        }

        if let Some(phone) = member.phone.as_deref() {
            let text = render_sms(notice, &context);
            match self.notifier.send_tenant_sms(&self.db, &wallets, &tenant.config, phone, &text).await {
                Ok(delivery) => sent |= delivery == Delivery::Sent,
                // SMS is best effort once the mail is out
                Err(e) => warn!(invoice = %invoice.number, error = %e, "Failed to send invoice SMS"),
            }
        }
        Ok(sent)
    }

    /// Sending report and console event for the tenant's owner, when the job did something. The
    /// owner is also warned when the job left the messaging credit low.
    async fn record_report(&self, tenant: &Tenant, kind: EventType, report: &JobReport, now: DateTime<Utc>) -> Result<(), Error> {
        if report.processed == 0 {
            return Ok(());
        }
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut events = Events::new(&mut conn);
        let sending_report = events
            .create_sending_report(tenant.service.id, kind, report.processed as i32, report.total_amount)
            .await?;
        events
            .create(&ConsoleEventCreateDBRequest {
                service_id: tenant.service.id,
                member_id: Some(tenant.service.member_id),
                event_type: kind,
                object_id: Some(sending_report.id),
            })
            .await?;
        info!(kind = kind.as_str(), processed = report.processed, notified = report.notified, "Invoicing job report");
        drop(conn);

        if let Err(e) = notify_for_messaging_credit(&self.db, &tenant.service, now).await {
            warn!(error = %e, "Failed to check messaging credit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cycle::BillingCycle;
    use crate::config::EmailTransportConfig;
    use crate::db::handlers::{MessagingBalances, Payments};
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::email::EmailService;
    use crate::sms::SmsGateway;
    use crate::test_utils::{create_test_config, create_test_member, create_test_notifier, create_test_service};
    use chrono::TimeZone;
    use sqlx::PgPool;
    use std::sync::Arc;
    use tokio_util::task::TaskTracker;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    fn days(n: i64) -> NaiveDate {
        now().date_naive() + Duration::days(n)
    }

    struct Seed {
        service_id: ServiceId,
        subscription: SubscriptionDBResponse,
    }

    async fn seed(pool: &PgPool, expiry: NaiveDate) -> Seed {
        let owner = create_test_member(pool, "owner").await;
        let customer = create_test_member(pool, "customer@example.com").await;
        let service = create_test_service(pool, owner.id, "Acme").await;
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                service_id: service.id,
                member_id: customer.id,
                product_id: None,
                monthly_cost: Decimal::from(5000),
                billing_cycle: BillingCycle::Quarterly,
                details: "Hosting".to_string(),
                expiry: Some(expiry),
                invoice_tolerance: 1,
                status: SubscriptionStatus::Active,
            })
            .await
            .unwrap();
        Seed {
            service_id: service.id,
            subscription,
        }
    }

    async fn invoice_due(pool: &PgPool, seed: &Seed, number: &str, due_date: NaiveDate) -> InvoiceDBResponse {
        let mut conn = pool.acquire().await.unwrap();
        Invoices::new(&mut conn)
            .create(&InvoiceCreateDBRequest {
                service_id: seed.service_id,
                subscription_id: seed.subscription.id,
                member_id: Some(seed.subscription.member_id),
                number: number.to_string(),
                amount: Decimal::from(5000),
                months_count: 1,
                date_issued: now() - Duration::days(20),
                due_date,
                is_one_off: false,
                entries: vec![],
            })
            .await
            .unwrap()
    }

    /// Nothing listens on port 1, so every mail fails to connect
    fn failing_notifier() -> Notifier {
        let mut config = create_test_config();
        config.email.transport = EmailTransportConfig::Smtp {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "ikwen".to_string(),
            password: "secret".to_string(),
            use_tls: false,
        };
        let email = EmailService::new(&config).unwrap();
        let sms = SmsGateway::new(&config.sms).unwrap();
        Notifier::new(Arc::new(email), sms, TaskTracker::new())
    }

    async fn credit_mail(pool: &PgPool, service_id: ServiceId, count: i32) {
        let mut conn = pool.acquire().await.unwrap();
        MessagingBalances::new(&mut conn).credit(service_id, count, 0).await.unwrap();
    }

    fn jobs(pool: &PgPool) -> Invoicing {
        Invoicing::new(DbRouter::new(pool.clone()), create_test_notifier()).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_send_invoices_selects_expiry_at_gap(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        let jobs = jobs(&pool);

        let report = jobs.send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(report.total_amount, Decimal::from(5000));

        let mut conn = pool.acquire().await.unwrap();
        let invoices = Invoices::new(&mut conn)
            .list(&crate::db::handlers::invoices::InvoiceFilter::new(seed.service_id, Default::default()))
            .await
            .unwrap();
        assert_eq!(invoices.len(), 1);
        let invoice = &invoices[0];
        assert_eq!(invoice.number, "A1/0324");
        assert_eq!(invoice.due_date, days(15));
        assert_eq!(invoice.reminders_sent, 1);
        assert_eq!(invoice.last_reminder, Some(now()));

        let reports = Events::new(&mut conn).list_sending_reports(seed.service_id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, "InvoicesSentEvent");

        // A second run the same day does not invoice twice
        let again = jobs.send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_mail_failure_keeps_invoice_on_reminder_schedule(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        credit_mail(&pool, seed.service_id, 10).await;
        let jobs = Invoicing::new(DbRouter::new(pool.clone()), failing_notifier()).unwrap();

        let report = jobs.send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.notified, 0);
        assert_eq!(report.failures, 0);
        assert_eq!(report.total_amount, Decimal::from(5000));

        let mut conn = pool.acquire().await.unwrap();
        let invoice = Invoices::new(&mut conn)
            .get_by_number(seed.service_id, "A1/0324")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.reminders_sent, 1);
        assert_eq!(invoice.last_reminder, Some(now()));
        let reports = Events::new(&mut conn).list_sending_reports(seed.service_id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].count, 1);
        assert_eq!(reports[0].total_amount, Decimal::from(5000));
        // The credit of the undelivered mail is refunded
        assert_eq!(MessagingBalances::new(&mut conn).get(seed.service_id).await.unwrap().mail_count, 10);
        drop(conn);

        // The open invoice is not issued twice, and reminders come on schedule
        let again = jobs.send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(again.processed, 0);
        let reminders = jobs
            .send_invoice_reminders(seed.service_id, now() + Duration::days(5))
            .await
            .unwrap();
        assert_eq!(reminders.processed, 1);
        let mut conn = pool.acquire().await.unwrap();
        let reminded = Invoices::new(&mut conn).get_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(reminded.reminders_sent, 2);
        assert_eq!(reminded.last_reminder, Some(now() + Duration::days(5)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_pull_invoice_tenants_are_not_invoiced(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        sqlx::query("UPDATE invoicing_configs SET pull_invoice = TRUE WHERE service_id = $1")
            .bind(seed.service_id)
            .execute(&pool)
            .await
            .unwrap();

        let report = jobs(&pool).send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report, JobReport::default());
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Invoices::new(&mut conn).count_for_service(seed.service_id).await.unwrap(), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_low_mail_credit_warns_owner_once(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        credit_mail(&pool, seed.service_id, 5).await;
        let jobs = jobs(&pool);

        let report = jobs.send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report.notified, 1);

        let mut conn = pool.acquire().await.unwrap();
        let warnings = Events::new(&mut conn)
            .list_for_service(seed.service_id, EventType::LowMessagingCredit)
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        let service = Services::new(&mut conn).get_by_id(seed.service_id).await.unwrap().unwrap();
        assert_eq!(warnings[0].member_id, Some(service.member_id));
        drop(conn);

        // Already warned today
        let again = notify_for_messaging_credit(&jobs.db, &service, now()).await.unwrap();
        assert_eq!(again, None);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_send_invoices_ignores_other_expiry_dates(pool: PgPool) {
        let seed = seed(&pool, days(14)).await;
        let report = jobs(&pool).send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report, JobReport::default());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_separate_billing_cycle_bills_whole_cycle(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            sqlx::query("UPDATE invoicing_configs SET separate_billing_cycle = TRUE WHERE service_id = $1")
                .bind(seed.service_id)
                .execute(&mut *conn)
                .await
                .unwrap();
        }
        let report = jobs(&pool).send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report.total_amount, Decimal::from(15000));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_send_invoices_pays_from_wallet(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            OperatorWallets::new(&mut conn)
                .credit(seed.service_id, "mtn-momo", Decimal::from(10000))
                .await
                .unwrap();
        }
        let report = jobs(&pool).send_invoices(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.notified, 0);

        let mut conn = pool.acquire().await.unwrap();
        let invoice = Invoices::new(&mut conn)
            .get_by_number(seed.service_id, "A1/0324")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(Payments::new(&mut conn).list_for_invoice(invoice.id).await.unwrap()[0].method, "WalletDebit");
        let subscription = Subscriptions::new(&mut conn).get_by_id(seed.subscription.id).await.unwrap().unwrap();
        assert_eq!(subscription.expiry, Some(days(45)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reminders_follow_delay(pool: PgPool) {
        let seed = seed(&pool, days(30)).await;
        let on_time = invoice_due(&pool, &seed, "A1/0224", days(10)).await;
        let too_early = invoice_due(&pool, &seed, "A2/0224", days(10)).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            let mut invoices = Invoices::new(&mut conn);
            invoices.record_reminder(on_time.id, now() - Duration::days(5)).await.unwrap();
            invoices.record_reminder(too_early.id, now() - Duration::days(3)).await.unwrap();
        }

        let report = jobs(&pool).send_invoice_reminders(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);

        let mut conn = pool.acquire().await.unwrap();
        let reminded = Invoices::new(&mut conn).get_by_id(on_time.id).await.unwrap().unwrap();
        assert_eq!(reminded.reminders_sent, 2);
        assert_eq!(reminded.last_reminder, Some(now()));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_overdue_notices(pool: PgPool) {
        let seed = seed(&pool, days(-1)).await;
        let invoice = invoice_due(&pool, &seed, "A1/0224", days(-1)).await;
        let jobs = jobs(&pool);

        let first = jobs.send_invoice_overdue_notices(seed.service_id, now()).await.unwrap();
        assert_eq!(first.processed, 1);
        let mut conn = pool.acquire().await.unwrap();
        let overdue = Invoices::new(&mut conn).get_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(overdue.status, InvoiceStatus::Overdue);
        assert_eq!(overdue.overdue_notices_sent, 1);

        // Nothing until overdue_delay (2 days) has passed
        let next_day = jobs
            .send_invoice_overdue_notices(seed.service_id, now() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(next_day.processed, 0);
        let second = jobs
            .send_invoice_overdue_notices(seed.service_id, now() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(second.processed, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_suspension_after_tolerance(pool: PgPool) {
        let seed = seed(&pool, days(-2)).await;
        let late = invoice_due(&pool, &seed, "A1/0224", days(-2)).await;
        let recent = invoice_due(&pool, &seed, "A2/0224", days(0)).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            let mut invoices = Invoices::new(&mut conn);
            invoices.transition(late.id, InvoiceStatus::Overdue).await.unwrap();
            invoices.transition(recent.id, InvoiceStatus::Overdue).await.unwrap();
        }

        let report = jobs(&pool).suspend_customers_services(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);

        let mut conn = pool.acquire().await.unwrap();
        let late = Invoices::new(&mut conn).get_by_id(late.id).await.unwrap().unwrap();
        assert_eq!(late.status, InvoiceStatus::Exceeded);
        let recent = Invoices::new(&mut conn).get_by_id(recent.id).await.unwrap().unwrap();
        assert_eq!(recent.status, InvoiceStatus::Overdue);
        let subscription = Subscriptions::new(&mut conn).get_by_id(seed.subscription.id).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Suspended);

        let events = Events::new(&mut conn)
            .list_for_service(seed.service_id, EventType::SuspensionNoticesSentEvent)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_suspension_records_event_and_calls_return_url(pool: PgPool) {
        let seed = seed(&pool, days(-2)).await;
        let late = invoice_due(&pool, &seed, "A1/0224", days(-2)).await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/suspended"))
            .and(query_param("reference_id", seed.subscription.id.to_string()))
            .and(query_param("invoice_number", "A1/0224"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        {
            let mut conn = pool.acquire().await.unwrap();
            Invoices::new(&mut conn).transition(late.id, InvoiceStatus::Overdue).await.unwrap();
            sqlx::query("UPDATE invoicing_configs SET suspension_return_url = $2 WHERE service_id = $1")
                .bind(seed.service_id)
                .bind(format!("{}/suspended", server.uri()))
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        let report = jobs(&pool).suspend_customers_services(seed.service_id, now()).await.unwrap();
        assert_eq!(report.processed, 1);

        let mut conn = pool.acquire().await.unwrap();
        let suspended = Events::new(&mut conn)
            .list_for_service(seed.service_id, EventType::ServiceSuspended)
            .await
            .unwrap();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].member_id, Some(seed.subscription.member_id));
        assert_eq!(suspended[0].object_id, Some(late.id));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_unreachable_return_url_does_not_block_suspension(pool: PgPool) {
        let seed = seed(&pool, days(-2)).await;
        let late = invoice_due(&pool, &seed, "A1/0224", days(-2)).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            Invoices::new(&mut conn).transition(late.id, InvoiceStatus::Overdue).await.unwrap();
            sqlx::query("UPDATE invoicing_configs SET suspension_return_url = 'http://127.0.0.1:9/suspended' WHERE service_id = $1")
                .bind(seed.service_id)
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        let report = jobs(&pool).suspend_customers_services(seed.service_id, now()).await.unwrap();
        assert_eq!((report.processed, report.failures), (1, 0));
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn).get_by_id(seed.subscription.id).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Suspended);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_run_daily_covers_active_tenants(pool: PgPool) {
        let seed = seed(&pool, days(15)).await;
        sqlx::query("UPDATE services SET status = 'active' WHERE id = $1")
            .bind(seed.service_id)
            .execute(&pool)
            .await
            .unwrap();
        let report = jobs(&pool).run_daily(now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failures, 0);
    }
}
