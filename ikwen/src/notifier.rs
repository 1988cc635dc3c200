//! Mail and SMS delivery on behalf of tenants.
//!
//! Notices sent by jobs are paid from the tenant's messaging balance, which lives in the
//! `wallets` database: a mail costs one credit, an SMS one credit per 160 characters. A credit
//! taken for a message that could not be delivered is refunded. Account mails (welcome, password
//! reset) are free and sent in the background. A tenant whose balance runs low or out gets a
//! console event, see [`notify_for_messaging_credit`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::db::errors::DbError;
use crate::db::handlers::{Events, MessagingBalances};
use crate::db::models::{
    events::{ConsoleEventCreateDBRequest, EventType},
    services::{ConfigDBResponse, ServiceDBResponse},
    wallets::MessagingBalanceDBResponse,
};
use crate::db::router::DbRouter;
use crate::email::{EmailService, OutgoingMail, Sender, render_layout};
use crate::errors::Error;
use crate::sms::{SmsDelivery, SmsGateway, count_pages};
use crate::types::abbrev_uuid;

/// Outcome of a paid delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The tenant has no credit left for this channel
    NoCredit,
    /// Nothing to send to, or the channel is disabled
    Skipped,
}

/// Mail credit under which the tenant's owner is warned
pub const LOW_MAIL_LIMIT: i32 = 100;

/// SMS credit under which the tenant's owner is warned
pub const LOW_SMS_LIMIT: i32 = 100;

/// Alert a messaging balance calls for. Mail is the channel every notice uses, so an empty
/// balance means no mail credit left.
pub fn credit_alert(balance: &MessagingBalanceDBResponse) -> Option<EventType> {
    let low = |count: i32, limit: i32| 0 < count && count < limit;
    if balance.mail_count <= 0 {
        Some(EventType::EmptyMessagingCredit)
    } else if low(balance.mail_count, LOW_MAIL_LIMIT) || low(balance.sms_count, LOW_SMS_LIMIT) {
        Some(EventType::LowMessagingCredit)
    } else {
        None
    }
}

/// Warn the tenant's owner that its messaging credit is low or exhausted. Each alert is recorded
/// at most once a day. Returns the alert recorded, if any.
#[instrument(skip_all, fields(service_id = %abbrev_uuid(&service.id)), err)]
pub async fn notify_for_messaging_credit(db: &DbRouter, service: &ServiceDBResponse, now: DateTime<Utc>) -> Result<Option<EventType>, Error> {
    let balance = {
        let wallets = db.wallets();
        let mut conn = wallets.acquire().await.map_err(DbError::from)?;
        MessagingBalances::new(&mut conn).get(service.id).await?
    };
    let Some(alert) = credit_alert(&balance) else {
        return Ok(None);
    };

    let mut conn = db.acquire().await.map_err(DbError::from)?;
    let mut events = Events::new(&mut conn);
    if events.exists_since(service.id, alert, now - Duration::days(1)).await? {
        return Ok(None);
    }
    events
        .create(&ConsoleEventCreateDBRequest {
            service_id: service.id,
            member_id: Some(service.member_id),
            event_type: alert,
            object_id: None,
        })
        .await?;
    info!(alert = alert.as_str(), mail = balance.mail_count, sms = balance.sms_count, "Messaging credit alert");
    Ok(Some(alert))
}

/// Cameroonian numbers are stored in national form and dialled with the `237` prefix.
pub fn international_phone(phone: &str) -> String {
    if phone.len() > 9 { phone.to_string() } else { format!("237{phone}") }
}

#[derive(Clone)]
pub struct Notifier {
    email: Arc<EmailService>,
    sms: SmsGateway,
    tasks: TaskTracker,
}

impl Notifier {
    pub fn new(email: Arc<EmailService>, sms: SmsGateway, tasks: TaskTracker) -> Self {
        Self { email, sms, tasks }
    }

    pub fn email(&self) -> &EmailService {
        &self.email
    }

    pub fn sms(&self) -> &SmsGateway {
        &self.sms
    }

    /// Tasks spawned by [`Notifier::spawn`], awaited on shutdown
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Run a mail in the background. Failures are logged.
    pub fn spawn<F>(&self, what: &'static str, future: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.tasks.spawn(
            async move {
                if let Err(e) = future.await {
                    warn!(error = %e, "Failed to send {what}");
                }
            }
            .in_current_span(),
        );
    }

    /// Send a tenant mail wrapped in the tenant's layout, paid with one mail credit
    #[instrument(skip_all, fields(service_id = %abbrev_uuid(&config.service_id), to = %to_email), err)]
    pub async fn send_tenant_mail(
        &self,
        wallets: &PgPool,
        config: &ConfigDBResponse,
        to_email: &str,
        to_name: Option<&str>,
        subject: &str,
        message_html: &str,
    ) -> Result<Delivery, Error> {
        if to_email.is_empty() {
            return Ok(Delivery::Skipped);
        }
        let mut conn = wallets.acquire().await.map_err(DbError::from)?;
        if !MessagingBalances::new(&mut conn).debit_mail(config.service_id, 1).await? {
            debug!("Mail credit exhausted");
            return Ok(Delivery::NoCredit);
        }

        let html = render_layout(&config.company_name, subject, message_html, &config.signature)?;
        let sender: Sender = self.email.tenant_sender(&config.company_name, config.contact_email.as_deref());
        let mail = OutgoingMail {
            to_email: to_email.to_string(),
            to_name: to_name.map(str::to_string),
            subject: subject.to_string(),
            html,
        };
        if let Err(e) = self.email.send(&sender, &mail).await {
            MessagingBalances::new(&mut conn).refund_mail(config.service_id, 1).await?;
            return Err(e);
        }
        Ok(Delivery::Sent)
    }

    /// Send a tenant SMS through its configured method, paid per page
    #[instrument(skip_all, fields(service_id = %abbrev_uuid(&config.service_id)), err)]
    pub async fn send_tenant_sms(&self, db: &PgPool, wallets: &PgPool, config: &ConfigDBResponse, phone: &str, text: &str) -> Result<Delivery, Error> {
        if phone.is_empty() || text.is_empty() {
            return Ok(Delivery::Skipped);
        }
        let pages = count_pages(text);
        let mut wallet_conn = wallets.acquire().await.map_err(DbError::from)?;
        if !MessagingBalances::new(&mut wallet_conn).debit_sms(config.service_id, pages).await? {
            debug!("SMS credit exhausted");
            return Ok(Delivery::NoCredit);
        }

        let mut conn = db.acquire().await.map_err(DbError::from)?;
        match self.sms.deliver(&mut conn, config, &international_phone(phone), text).await {
            Ok(SmsDelivery::Skipped) => {
                MessagingBalances::new(&mut wallet_conn).credit(config.service_id, 0, pages).await?;
                Ok(Delivery::Skipped)
            }
            Ok(_) => Ok(Delivery::Sent),
            Err(e) => {
                MessagingBalances::new(&mut wallet_conn).credit(config.service_id, 0, pages).await?;
                Err(Error::Internal {
                    operation: format!("send SMS: {e}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_international_phone() {
        assert_eq!(international_phone("677001122"), "237677001122");
        assert_eq!(international_phone("237677001122"), "237677001122");
    }

    #[test]
    fn test_credit_alert() {
        let balance = |mail_count, sms_count| MessagingBalanceDBResponse {
            service_id: uuid::Uuid::new_v4(),
            mail_count,
            sms_count,
        };
        assert_eq!(credit_alert(&balance(0, 500)), Some(EventType::EmptyMessagingCredit));
        assert_eq!(credit_alert(&balance(LOW_MAIL_LIMIT - 1, 0)), Some(EventType::LowMessagingCredit));
        assert_eq!(credit_alert(&balance(500, 3)), Some(EventType::LowMessagingCredit));
        // A tenant without SMS credit does not send SMS
        assert_eq!(credit_alert(&balance(LOW_MAIL_LIMIT, 0)), None);
    }
}
