//! Invoice payments.
//!
//! Whatever the channel (cashier, operator wallet, mobile money), a payment that covers an
//! invoice extends the paid-until date of its subscription by [`get_days_count`] of the months
//! it covers and reactivates the subscription.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info, instrument, warn};

use crate::billing::{
    cycle::{BillingCycle, get_days_count},
    numbering::{NUMBERING_ATTEMPTS, NumberPrefix, is_number_collision, next_invoice_number},
    status::{InvoiceStatus, SubscriptionStatus},
    templates::{InvoiceContext, Notice, render_notice, render_subscription_activated},
};
use crate::db::{
    errors::DbError,
    handlers::{Events, Invoices, Members, OperatorWallets, Payments, Products, Repository, Services, Subscriptions},
    models::{
        events::{ConsoleEventCreateDBRequest, EventType},
        invoices::{InvoiceCreateDBRequest, InvoiceDBResponse, InvoiceEntry},
        payments::{PaymentCreateDBRequest, PaymentDBResponse, PaymentMethod},
        services::{ServiceUpdateDBRequest, ServiceVersion},
        subscriptions::{SubscriptionDBResponse, SubscriptionUpdateDBRequest},
    },
    router::DbRouter,
};
use crate::errors::Error;
use crate::notifier::Notifier;
use crate::types::{InvoiceId, MemberId, ServiceId, SubscriptionId, abbrev_uuid};

/// A payment that settles an invoice
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    /// Amount collected. Anything above the balance due is recorded as processing fees.
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Months granted on top of those the invoice covers
    pub extra_months: i32,
    pub cashier_id: Option<MemberId>,
    pub processor_tx_id: Option<String>,
}

/// An invoice created by staff
#[derive(Debug, Clone)]
pub struct ManualInvoice {
    pub subscription_id: SubscriptionId,
    /// Defaults to the monthly cost times `months_count`
    pub amount: Option<Decimal>,
    pub months_count: i32,
    pub due_date: NaiveDate,
    pub is_one_off: bool,
    pub entries: Vec<InvoiceEntry>,
}

/// Paid-until date after a payment covering `days` days.
///
/// A suspended subscription restarts from today, minus the tolerance it already enjoyed while
/// overdue. Otherwise the days are added to the current expiry, or to today when there is none.
pub fn extended_expiry(status: SubscriptionStatus, expiry: Option<NaiveDate>, today: NaiveDate, days: i64, tolerance: i32) -> NaiveDate {
    match (status, expiry) {
        (SubscriptionStatus::Suspended, _) => today + Duration::days(days - i64::from(tolerance)),
        (_, Some(expiry)) => expiry + Duration::days(days),
        (_, None) => today + Duration::days(days),
    }
}

fn not_found(resource: &str, id: impl ToString) -> Error {
    Error::NotFound {
        resource: resource.to_string(),
        id: id.to_string(),
    }
}

/// Extend and reactivate the subscription of a paid invoice. Returns the updated subscription.
async fn settle_subscription(
    db: &mut PgConnection,
    invoice: &InvoiceDBResponse,
    extra_months: i32,
    today: NaiveDate,
) -> Result<SubscriptionDBResponse, Error> {
    let mut subscriptions = Subscriptions::new(db);
    let subscription = subscriptions
        .get_by_id(invoice.subscription_id)
        .await?
        .ok_or_else(|| not_found("Subscription", invoice.subscription_id))?;

    let months = u32::try_from(invoice.months_count + extra_months).unwrap_or(0);
    let days = get_days_count(months);
    let expiry = extended_expiry(subscription.status, subscription.expiry, today, days, subscription.invoice_tolerance);
    let mut subscription = subscriptions.set_expiry(subscription.id, expiry).await?;

    match subscription.status {
        SubscriptionStatus::Active => {}
        SubscriptionStatus::Canceled => {
            warn!(subscription_id = %abbrev_uuid(&subscription.id), "Payment received for a canceled subscription");
        }
        _ => subscription = subscriptions.transition(subscription.id, SubscriptionStatus::Active).await?,
    }

    if invoice.is_one_off {
        Services::new(&mut *db)
            .update(
                invoice.service_id,
                &ServiceUpdateDBRequest {
                    version: Some(ServiceVersion::Full),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(subscription)
}

#[derive(Clone)]
pub struct Payer {
    db: DbRouter,
    notifier: Notifier,
}

impl Payer {
    pub fn new(db: DbRouter, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Settle an invoice with a payment covering at least its balance due
    #[instrument(skip(self, confirmation), fields(invoice_id = %abbrev_uuid(&invoice_id), method = %confirmation.method), err)]
    pub async fn confirm_invoice_payment(
        &self,
        invoice_id: InvoiceId,
        confirmation: &PaymentConfirmation,
        now: DateTime<Utc>,
    ) -> Result<InvoiceDBResponse, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut tx = conn.begin().await.map_err(DbError::from)?;

        let invoice = Invoices::new(&mut tx)
            .get_by_id(invoice_id)
            .await?
            .ok_or_else(|| not_found("Invoice", invoice_id))?;

        if let Some(processor_tx_id) = confirmation.processor_tx_id.as_deref()
            && Payments::new(&mut tx).exists_for_processor_tx(invoice_id, processor_tx_id).await?
        {
            info!(processor_tx_id, "Payment already recorded");
            return Ok(invoice);
        }
        if invoice.status == InvoiceStatus::Paid {
            return Err(Error::Conflict {
                message: format!("Invoice {} is already paid", invoice.number),
            });
        }

        let due = invoice.balance_due();
        if confirmation.amount < due {
            return Err(Error::BadRequest {
                message: format!("Payment of {} does not cover the balance due of {due}", confirmation.amount),
            });
        }
        let fees = confirmation.amount - due;
        if fees > Decimal::ZERO {
            Invoices::new(&mut tx).set_processing_fees(invoice_id, invoice.processing_fees + fees).await?;
        }

        Payments::new(&mut tx)
            .create(&PaymentCreateDBRequest {
                invoice_id,
                method: confirmation.method,
                amount: due,
                cashier_id: confirmation.cashier_id,
                processor_tx_id: confirmation.processor_tx_id.clone(),
            })
            .await?;
        let invoice = Invoices::new(&mut tx).add_payment(invoice_id, due).await?;
        settle_subscription(&mut tx, &invoice, confirmation.extra_months, now.date_naive()).await?;
        self.record_confirmation(&mut tx, &invoice).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(number = %invoice.number, "Invoice paid");
        self.mail_confirmation(&invoice);
        Ok(invoice)
    }

    /// Cashier payment, partial or full. The subscription is extended once the invoice is fully
    /// covered.
    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&invoice_id), %amount), err)]
    pub async fn record_payment(
        &self,
        invoice_id: InvoiceId,
        amount: Decimal,
        method: PaymentMethod,
        cashier_id: Option<MemberId>,
        now: DateTime<Utc>,
    ) -> Result<(InvoiceDBResponse, PaymentDBResponse), Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut tx = conn.begin().await.map_err(DbError::from)?;

        let invoice = Invoices::new(&mut tx).add_payment(invoice_id, amount).await?;
        let payment = Payments::new(&mut tx)
            .create(&PaymentCreateDBRequest {
                invoice_id,
                method,
                amount,
                cashier_id,
                processor_tx_id: None,
            })
            .await?;

        let paid = invoice.status == InvoiceStatus::Paid;
        if paid {
            settle_subscription(&mut tx, &invoice, 0, now.date_naive()).await?;
            self.record_confirmation(&mut tx, &invoice).await?;
        }
        tx.commit().await.map_err(DbError::from)?;

        if paid {
            self.mail_confirmation(&invoice);
        }
        Ok((invoice, payment))
    }

    /// Pay an invoice from the tenant's operator wallets, richest wallet first
    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&invoice_id)), err)]
    pub async fn pay_with_wallet_balance(&self, invoice_id: InvoiceId, now: DateTime<Utc>) -> Result<InvoiceDBResponse, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let invoice = Invoices::new(&mut conn)
            .get_by_id(invoice_id)
            .await?
            .ok_or_else(|| not_found("Invoice", invoice_id))?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(Error::Conflict {
                message: format!("Invoice {} is already paid", invoice.number),
            });
        }
        let due = invoice.balance_due();

        let mut wallet_conn = self.db.wallets().acquire().await.map_err(DbError::from)?;
        let mut wallet_tx = wallet_conn.begin().await.map_err(DbError::from)?;
        let wallets = OperatorWallets::new(&mut wallet_tx).list(invoice.service_id).await?;
        let available: Decimal = wallets.iter().map(|w| w.balance).sum();
        if available < due {
            return Err(Error::BadRequest {
                message: format!("Wallet balance of {available} does not cover {due}"),
            });
        }

        let mut remaining = due;
        for wallet in wallets.iter().filter(|w| w.balance > Decimal::ZERO) {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(wallet.balance);
            OperatorWallets::new(&mut wallet_tx)
                .debit(invoice.service_id, &wallet.provider, take)
                .await?
                .ok_or_else(|| Error::Conflict {
                    message: format!("Balance of wallet {} changed during payment", wallet.provider),
                })?;
            remaining -= take;
        }

        let mut tx = conn.begin().await.map_err(DbError::from)?;
        Payments::new(&mut tx)
            .create(&PaymentCreateDBRequest {
                invoice_id,
                method: PaymentMethod::WalletDebit,
                amount: due,
                cashier_id: None,
                processor_tx_id: None,
            })
            .await?;
        let invoice = Invoices::new(&mut tx).add_payment(invoice_id, due).await?;
        settle_subscription(&mut tx, &invoice, 0, now.date_naive()).await?;
        self.record_confirmation(&mut tx, &invoice).await?;
        tx.commit().await.map_err(DbError::from)?;

        if let Err(e) = wallet_tx.commit().await {
            // The invoice is already settled at this point
            tracing::error!(error = %e, number = %invoice.number, "Failed to commit wallet debit");
        }
        info!(number = %invoice.number, %due, "Invoice paid from wallet balance");
        Ok(invoice)
    }

    /// Create an invoice by hand. Numbers use the `M` prefix.
    #[instrument(skip(self, request), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn create_manual_invoice(&self, service_id: ServiceId, request: &ManualInvoice, now: DateTime<Utc>) -> Result<InvoiceDBResponse, Error> {
        if request.months_count < 0 {
            return Err(Error::BadRequest {
                message: "months_count cannot be negative".to_string(),
            });
        }
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let subscription = Subscriptions::new(&mut conn)
            .get_by_id(request.subscription_id)
            .await?
            .filter(|s| s.service_id == service_id)
            .ok_or_else(|| not_found("Subscription", request.subscription_id))?;

        let amount = request
            .amount
            .unwrap_or_else(|| subscription.monthly_cost * Decimal::from(request.months_count.max(1)));
        if amount <= Decimal::ZERO {
            return Err(Error::BadRequest {
                message: "Invoice amount must be positive".to_string(),
            });
        }
        let entries = if request.entries.is_empty() {
            vec![InvoiceEntry::new(subscription.details.clone(), request.months_count.max(1), subscription.monthly_cost)]
        } else {
            request.entries.clone()
        };

        let mut attempt = 1;
        loop {
            let number = next_invoice_number(&mut conn, service_id, NumberPrefix::Manual, now).await?;
            let created = Invoices::new(&mut conn)
                .create(&InvoiceCreateDBRequest {
                    service_id,
                    subscription_id: subscription.id,
                    member_id: Some(subscription.member_id),
                    number: number.clone(),
                    amount,
                    months_count: request.months_count,
                    date_issued: now,
                    due_date: request.due_date,
                    is_one_off: request.is_one_off,
                    entries: entries.clone(),
                })
                .await;
            match created {
                Err(e) if is_number_collision(&e) && attempt < NUMBERING_ATTEMPTS => {
                    debug!(%number, attempt, "Invoice number taken, numbering again");
                    attempt += 1;
                }
                other => return Ok(other?),
            }
        }
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id), %billing_cycle), err)]
    pub async fn change_billing_cycle(&self, subscription_id: SubscriptionId, billing_cycle: BillingCycle) -> Result<SubscriptionDBResponse, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut subscriptions = Subscriptions::new(&mut conn);
        let subscription = subscriptions
            .get_by_id(subscription_id)
            .await?
            .ok_or_else(|| not_found("Subscription", subscription_id))?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(Error::BadRequest {
                message: "Cannot change the billing cycle of a canceled subscription".to_string(),
            });
        }
        let updated = subscriptions
            .update(
                subscription_id,
                &SubscriptionUpdateDBRequest {
                    billing_cycle: Some(billing_cycle),
                    ..Default::default()
                },
            )
            .await?;
        Ok(updated)
    }

    /// Record the activation of a new subscription for its member, then mail and text them in the
    /// background
    #[instrument(skip_all, fields(subscription_id = %abbrev_uuid(&subscription.id)), err)]
    pub async fn announce_subscription(&self, subscription: &SubscriptionDBResponse) -> Result<(), Error> {
        {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Events::new(&mut conn)
                .create(&ConsoleEventCreateDBRequest {
                    service_id: subscription.service_id,
                    member_id: Some(subscription.member_id),
                    event_type: EventType::SubscriptionActivated,
                    object_id: Some(subscription.id),
                })
                .await?;
        }

        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let subscription = subscription.clone();
        self.notifier.spawn("subscription notice", async move {
            let (member, product, config) = {
                let mut conn = db.acquire().await.map_err(DbError::from)?;
                let Some(member) = Members::new(&mut conn).get_by_id(subscription.member_id).await? else {
                    return Ok(());
                };
                let product = match subscription.product_id {
                    Some(product_id) => Products::new(&mut conn).get_by_id(product_id).await?,
                    None => None,
                };
                let config = Services::new(&mut conn).get_config(subscription.service_id).await?;
                (member, product, config)
            };

            let (subject, message, sms) = render_subscription_activated(&subscription, product.as_ref(), &member.first_name, &config);
            let wallets = db.wallets();
            if let Some(email) = member.deliverable_email() {
                notifier
                    .send_tenant_mail(&wallets, &config, email, Some(&member.first_name), &subject, &message)
                    .await?;
            }
            if let Some(phone) = member.phone.as_deref() {
                notifier.send_tenant_sms(&db, &wallets, &config, phone, &sms).await?;
            }
            Ok(())
        });
        Ok(())
    }

    async fn record_confirmation(&self, db: &mut PgConnection, invoice: &InvoiceDBResponse) -> Result<(), Error> {
        Events::new(db)
            .create(&ConsoleEventCreateDBRequest {
                service_id: invoice.service_id,
                member_id: invoice.member_id,
                event_type: EventType::PaymentConfirmation,
                object_id: Some(invoice.id),
            })
            .await?;
        Ok(())
    }

    /// Mail the payment confirmation in the background
    fn mail_confirmation(&self, invoice: &InvoiceDBResponse) {
        let Some(member_id) = invoice.member_id else {
            return;
        };
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let invoice = invoice.clone();
        self.notifier.spawn("payment confirmation", async move {
            let mut conn = db.acquire().await.map_err(DbError::from)?;
            let Some(member) = Members::new(&mut conn).get_by_id(member_id).await? else {
                return Ok(());
            };
            let Some(email) = member.deliverable_email() else {
                return Ok(());
            };
            let mut services = Services::new(&mut conn);
            let config = services.get_config(invoice.service_id).await?;
            let invoicing_config = services.get_invoicing_config(invoice.service_id).await?;
            let description = Subscriptions::new(&mut conn)
                .get_by_id(invoice.subscription_id)
                .await?
                .map(|s| s.details)
                .unwrap_or_default();

            let context = InvoiceContext::new(&invoice, &member.first_name, &description, &config);
            let (subject, message) = render_notice(Notice::PaymentConfirmation, &invoicing_config, &context);
            notifier
                .send_tenant_mail(&db.wallets(), &config, email, Some(&member.first_name), &subject, &message)
                .await?;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::test_utils::{create_test_member, create_test_notifier, create_test_service};
    use chrono::TimeZone;
    use sqlx::PgPool;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_extended_expiry() {
        let today = date(2024, 3, 1);
        assert_eq!(
            extended_expiry(SubscriptionStatus::Active, Some(date(2024, 3, 10)), today, 30, 1),
            date(2024, 4, 9)
        );
        assert_eq!(extended_expiry(SubscriptionStatus::Pending, None, today, 30, 1), date(2024, 3, 31));
        assert_eq!(
            extended_expiry(SubscriptionStatus::Suspended, Some(date(2024, 1, 1)), today, 30, 3),
            date(2024, 3, 28)
        );
    }

    async fn seed(pool: &PgPool, status: SubscriptionStatus, expiry: Option<NaiveDate>) -> (ServiceId, SubscriptionDBResponse) {
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
                billing_cycle: BillingCycle::Monthly,
                details: "Hosting".to_string(),
                expiry,
                invoice_tolerance: 1,
                status,
            })
            .await
            .unwrap();
        (service.id, subscription)
    }

    fn manual(subscription_id: SubscriptionId, months_count: i32) -> ManualInvoice {
        ManualInvoice {
            subscription_id,
            amount: None,
            months_count,
            due_date: date(2024, 3, 10),
            is_one_off: false,
            entries: vec![],
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_manual_invoice_number_and_amount(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 3, 10))).await;
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let invoice = payer.create_manual_invoice(service_id, &manual(subscription.id, 3), now).await.unwrap();
        assert_eq!(invoice.number, "M1/0324");
        assert_eq!(invoice.amount, Decimal::from(15000));
        assert_eq!(invoice.entries.0.len(), 1);

        let second = payer.create_manual_invoice(service_id, &manual(subscription.id, 1), now).await.unwrap();
        assert_eq!(second.number, "M2/0324");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_concurrent_manual_invoices_get_distinct_numbers(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 3, 10))).await;
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let request = manual(subscription.id, 1);

        let (a, b, c, d) = tokio::join!(
            payer.create_manual_invoice(service_id, &request, now),
            payer.create_manual_invoice(service_id, &request, now),
            payer.create_manual_invoice(service_id, &request, now),
            payer.create_manual_invoice(service_id, &request, now),
        );
        let mut numbers: Vec<String> = [a, b, c, d].into_iter().map(|r| r.unwrap().number).collect();
        numbers.sort();
        assert_eq!(numbers, ["M1/0324", "M2/0324", "M3/0324", "M4/0324"]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_partial_then_full_cashier_payment_extends_subscription(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 3, 10))).await;
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let invoice = payer.create_manual_invoice(service_id, &manual(subscription.id, 1), now).await.unwrap();

        let (partial, _) = payer
            .record_payment(invoice.id, Decimal::from(2000), PaymentMethod::Cash, None, now)
            .await
            .unwrap();
        assert_eq!(partial.status, InvoiceStatus::Pending);

        let overpay = payer.record_payment(invoice.id, Decimal::from(4000), PaymentMethod::Cash, None, now).await;
        assert!(matches!(overpay, Err(Error::BadRequest { .. })));

        let (paid, _) = payer
            .record_payment(invoice.id, Decimal::from(3000), PaymentMethod::Cash, None, now)
            .await
            .unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.paid, paid.amount);

        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn).get_by_id(subscription.id).await.unwrap().unwrap();
        assert_eq!(subscription.expiry, Some(date(2024, 4, 9)));
        assert_eq!(Payments::new(&mut conn).list_for_invoice(invoice.id).await.unwrap().len(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_confirmation_reactivates_suspended_subscription(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 2, 1))).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            Subscriptions::new(&mut conn)
                .transition(subscription.id, SubscriptionStatus::Suspended)
                .await
                .unwrap();
        }
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let invoice = payer.create_manual_invoice(service_id, &manual(subscription.id, 1), now).await.unwrap();

        let confirmation = PaymentConfirmation {
            amount: Decimal::from(5100),
            method: PaymentMethod::MobileMoney,
            extra_months: 0,
            cashier_id: None,
            processor_tx_id: Some("FT-1".to_string()),
        };
        let paid = payer.confirm_invoice_payment(invoice.id, &confirmation, now).await.unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.processing_fees, Decimal::from(100));

        // Replaying the same processor transaction is a no-op
        payer.confirm_invoice_payment(invoice.id, &confirmation, now).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Payments::new(&mut conn).list_for_invoice(invoice.id).await.unwrap().len(), 1);
        let subscription = Subscriptions::new(&mut conn).get_by_id(subscription.id).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.expiry, Some(date(2024, 3, 30)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_wallet_payment_debits_richest_wallet_first(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 3, 10))).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            let mut wallets = OperatorWallets::new(&mut conn);
            wallets.credit(service_id, "mtn-momo", Decimal::from(3000)).await.unwrap();
            wallets.credit(service_id, "orange-money", Decimal::from(4000)).await.unwrap();
        }
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let invoice = payer.create_manual_invoice(service_id, &manual(subscription.id, 1), now).await.unwrap();

        let paid = payer.pay_with_wallet_balance(invoice.id, now).await.unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);

        let mut conn = pool.acquire().await.unwrap();
        let wallets = OperatorWallets::new(&mut conn).list(service_id).await.unwrap();
        let balance_of = |provider: &str| wallets.iter().find(|w| w.provider == provider).unwrap().balance;
        assert_eq!(balance_of("orange-money"), Decimal::ZERO);
        assert_eq!(balance_of("mtn-momo"), Decimal::from(2000));

        let again = payer.pay_with_wallet_balance(invoice.id, now).await;
        assert!(matches!(again, Err(Error::Conflict { .. })));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_wallet_payment_requires_enough_balance(pool: PgPool) {
        let (service_id, subscription) = seed(&pool, SubscriptionStatus::Active, Some(date(2024, 3, 10))).await;
        let payer = Payer::new(DbRouter::new(pool.clone()), create_test_notifier());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let invoice = payer.create_manual_invoice(service_id, &manual(subscription.id, 1), now).await.unwrap();
        let result = payer.pay_with_wallet_balance(invoice.id, now).await;
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }
}
