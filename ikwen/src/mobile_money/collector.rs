//! Invoice payments collected through mobile money.
//!
//! A payment goes through these steps:
//!
//! 1. A running `MoMoTransaction` is opened for the invoice. Only one may run per invoice.
//! 2. The payment request is submitted, retrying transient failures.
//! 3. A poller task checks the status every `poll_interval` until a final status, the
//!    provider's deadline (the transaction is then `Dropped`) or shutdown.
//! 4. Meanwhile the operator may post a notification.
//!
//! Whichever of the poller and the notification sees the final status first settles the
//! transaction. Settling is a compare-and-set out of the running state, so the invoice is
//! confirmed exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::{
    MobileMoneyError, MobileMoneyProvider, PaymentRequest, ProviderKind, ProviderStatus, create_provider, mtn, national_phone, orange,
    signing::{notification_url, verify_transaction},
    submit_with_retry,
};
use crate::billing::{
    payments::{PaymentConfirmation, Payer},
    status::InvoiceStatus,
};
use crate::config::{Config, MobileMoneyConfig};
use crate::db::{
    errors::DbError,
    handlers::{Invoices, MoMoTransactions, PaymentMeans, Repository},
    models::{
        mobile_money::{INVOICE_MODEL, TransactionCreateDBRequest, TransactionDBResponse, TransactionSettlement, TransactionStatus},
        payments::PaymentMethod,
    },
    router::DbRouter,
};
use crate::errors::Error;
use crate::types::{InvoiceId, ServiceId, TransactionId, abbrev_uuid};

/// Settlement callback of invoice transactions
const CONFIRM_INVOICE_CALLBACK: &str = "confirm_invoice_payment";

#[derive(Clone)]
pub struct Collector {
    db: DbRouter,
    payer: Payer,
    config: MobileMoneyConfig,
    public_url: String,
    secret_key: String,
    client: reqwest::Client,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Collector {
    pub fn new(db: DbRouter, payer: Payer, config: &Config, shutdown: CancellationToken) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.mobile_money.request_timeout)
            .build()
            .map_err(|e| Error::Internal {
                operation: format!("create mobile money HTTP client: {e}"),
            })?;
        Ok(Self {
            db,
            payer,
            config: config.mobile_money.clone(),
            public_url: config.public_url.clone(),
            secret_key: config.secret_key.clone().unwrap_or_default(),
            client,
            shutdown,
            tasks: TaskTracker::new(),
        })
    }

    /// Running pollers, awaited on shutdown
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    fn provider(&self, kind: ProviderKind, credentials: &serde_json::Value) -> Result<Arc<dyn MobileMoneyProvider>, MobileMoneyError> {
        Ok(create_provider(kind, credentials, &self.config, self.client.clone())?.into())
    }

    /// Ask a subscriber to pay an invoice from their mobile money account
    #[instrument(skip(self, phone), fields(service_id = %abbrev_uuid(&service_id), invoice_id = %abbrev_uuid(&invoice_id), provider = %kind), err)]
    pub async fn start_payment(
        &self,
        service_id: ServiceId,
        invoice_id: InvoiceId,
        kind: ProviderKind,
        phone: &str,
    ) -> Result<TransactionDBResponse, Error> {
        let phone = national_phone(phone);
        if phone.len() < 9 {
            return Err(Error::BadRequest {
                message: format!("'{phone}' is not a valid phone number"),
            });
        }

        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let invoice = Invoices::new(&mut conn)
            .get_by_id(invoice_id)
            .await?
            .filter(|i| i.service_id == service_id)
            .ok_or_else(|| Error::NotFound {
                resource: "Invoice".to_string(),
                id: invoice_id.to_string(),
            })?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(Error::Conflict {
                message: format!("Invoice {} is already paid", invoice.number),
            });
        }

        let mean = PaymentMeans::new(&mut conn)
            .get_by_slug(service_id, kind.slug())
            .await?
            .filter(|m| m.is_active)
            .ok_or_else(|| Error::BadRequest {
                message: format!("Payments with {kind} are not enabled"),
            })?;
        let provider = self.provider(kind, &mean.credentials.0).map_err(|e| Error::BadRequest { message: e.to_string() })?;

        let created = MoMoTransactions::new(&mut conn)
            .create(&TransactionCreateDBRequest {
                service_id,
                provider: kind.slug().to_string(),
                wallet: kind.slug().to_string(),
                phone: phone.clone(),
                amount: invoice.balance_due(),
                model: INVOICE_MODEL.to_string(),
                object_id: invoice.id,
                callback: CONFIRM_INVOICE_CALLBACK.to_string(),
            })
            .await;
        let transaction = match created {
            Err(DbError::UniqueViolation { .. }) => {
                return Err(Error::Conflict {
                    message: format!("A payment of invoice {} is already running", invoice.number),
                });
            }
            other => other?,
        };
        drop(conn);

        let notify_url =
            notification_url(&self.public_url, kind.slug(), &self.secret_key, &transaction.id).ok_or_else(|| Error::Internal {
                operation: "sign notification URL".to_string(),
            })?;
        let request = PaymentRequest {
            transaction_id: transaction.id,
            amount: transaction.amount,
            phone,
            description: format!("Invoice {}", invoice.number),
            notify_url,
        };

        let submitted = match submit_with_retry(provider.as_ref(), &request, self.config.max_submit_attempts, self.config.submit_backoff).await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!(error = %e, "Payment submission failed");
                let settled = self.settle(transaction.id, e.transaction_status(), None, Some(e.to_string())).await?;
                return Ok(settled.unwrap_or(transaction));
            }
        };

        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        match MoMoTransactions::new(&mut conn)
            .mark_submitted(transaction.id, &submitted.task_id, submitted.processor_tx_id.as_deref())
            .await
        {
            Ok(()) => {
                let deadline = Instant::now() + provider.poll_timeout();
                self.spawn_poller(provider, transaction.id, submitted.task_id, deadline);
            }
            // Already settled by a notification
            Err(DbError::NotFound) => debug!("Transaction settled before submission was recorded"),
            Err(e) => return Err(e.into()),
        }
        info!(transaction_id = %abbrev_uuid(&transaction.id), "Mobile money payment submitted");

        let transaction = MoMoTransactions::new(&mut conn).get_by_id(transaction.id).await?.unwrap_or(transaction);
        Ok(transaction)
    }

    /// A transaction of a tenant, with its current status
    pub async fn transaction(&self, service_id: ServiceId, id: TransactionId) -> Result<TransactionDBResponse, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        MoMoTransactions::new(&mut conn)
            .get_by_id(id)
            .await?
            .filter(|t| t.service_id == service_id)
            .ok_or_else(|| Error::NotFound {
                resource: "Transaction".to_string(),
                id: id.to_string(),
            })
    }

    /// Operator notification of a final status. Notifications about settled transactions are
    /// acknowledged and ignored.
    #[instrument(skip(self, signature, body), fields(provider = %kind, transaction_id = %abbrev_uuid(&transaction_id)), err)]
    pub async fn handle_notification(
        &self,
        kind: ProviderKind,
        transaction_id: TransactionId,
        signature: &str,
        body: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if !verify_transaction(&self.secret_key, &transaction_id, signature) {
            return Err(Error::Unauthenticated {
                message: Some("Invalid notification signature".to_string()),
            });
        }
        let transaction = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            MoMoTransactions::new(&mut conn).get_by_id(transaction_id).await?
        }
        .filter(|t| t.provider == kind.slug())
        .ok_or_else(|| Error::NotFound {
            resource: "Transaction".to_string(),
            id: transaction_id.to_string(),
        })?;
        if !transaction.is_running {
            debug!(status = %transaction.status, "Notification for a settled transaction");
            return Ok(());
        }

        let status = match kind {
            ProviderKind::MtnMomo => mtn::parse_notification(body, &transaction),
            ProviderKind::OrangeMoney => orange::parse_notification(body, &transaction),
            ProviderKind::Dummy => ProviderStatus::Succeeded { processor_tx_id: None },
        };
        debug!(?status, "Notification received");
        self.apply_status(transaction_id, status, now).await?;
        Ok(())
    }

    /// Settle a transaction from a provider status. Returns the settled transaction, or `None`
    /// when it is still pending or was settled by someone else.
    #[instrument(skip(self, status), fields(transaction_id = %abbrev_uuid(&transaction_id)), err)]
    pub async fn apply_status(
        &self,
        transaction_id: TransactionId,
        status: ProviderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TransactionDBResponse>, Error> {
        match status {
            ProviderStatus::Pending => Ok(None),
            ProviderStatus::Failed { reason } => {
                info!(reason, "Mobile money payment failed");
                self.settle(transaction_id, TransactionStatus::Failure, None, Some(reason)).await
            }
            ProviderStatus::Succeeded { processor_tx_id } => {
                let Some(transaction) = self
                    .settle(transaction_id, TransactionStatus::Success, processor_tx_id, Some("OK".to_string()))
                    .await?
                else {
                    return Ok(None);
                };
                self.run_callback(&transaction, now).await;
                Ok(Some(transaction))
            }
        }
    }

    async fn settle(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
        processor_tx_id: Option<String>,
        message: Option<String>,
    ) -> Result<Option<TransactionDBResponse>, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let settled = MoMoTransactions::new(&mut conn)
            .settle(
                transaction_id,
                &TransactionSettlement {
                    status,
                    processor_tx_id,
                    message,
                },
            )
            .await?;
        Ok(settled)
    }

    /// Credit the billed object of a successful transaction. Failures are kept on the
    /// transaction for staff to follow up, since the subscriber has paid.
    async fn run_callback(&self, transaction: &TransactionDBResponse, now: DateTime<Utc>) {
        if transaction.model != INVOICE_MODEL {
            warn!(model = %transaction.model, "No settlement callback for this object type");
            return;
        }
        let confirmation = PaymentConfirmation {
            amount: transaction.amount,
            method: PaymentMethod::MobileMoney,
            extra_months: 0,
            cashier_id: None,
            processor_tx_id: Some(transaction.processor_tx_id.clone().unwrap_or_else(|| transaction.id.to_string())),
        };
        if let Err(e) = self.payer.confirm_invoice_payment(transaction.object_id, &confirmation, now).await {
            error!(error = %e, transaction_id = %transaction.id, "Failed to confirm invoice paid by mobile money");
            let noted = async {
                let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                MoMoTransactions::new(&mut conn)
                    .set_message(transaction.id, &format!("Settlement failed: {e}"))
                    .await
            };
            if let Err(e) = noted.await {
                error!(error = %e, "Failed to record settlement failure");
            }
        }
    }

    fn spawn_poller(&self, provider: Arc<dyn MobileMoneyProvider>, transaction_id: TransactionId, task_id: String, deadline: Instant) {
        let collector = self.clone();
        let span = info_span!("momo_poller", provider = %provider.kind(), transaction_id = %abbrev_uuid(&transaction_id));
        self.tasks
            .spawn(async move { collector.poll(provider, transaction_id, &task_id, deadline).await }.instrument(span));
    }

    async fn poll(&self, provider: Arc<dyn MobileMoneyProvider>, transaction_id: TransactionId, task_id: &str, deadline: Instant) {
        debug!("Started checking payment status");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Status checks stopped by shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let status = {
                let conn = self.db.acquire().await;
                match conn {
                    Ok(mut conn) => MoMoTransactions::new(&mut conn).status(transaction_id).await,
                    Err(e) => Err(DbError::from(e)),
                }
            };
            match status {
                Ok(TransactionStatus::Pending) => {}
                Ok(status) => {
                    debug!(%status, "Transaction settled elsewhere");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read transaction status");
                    continue;
                }
            }

            if Instant::now() >= deadline {
                info!("No final status before the deadline, dropping payment");
                let message = Some("No final status from the provider before the deadline".to_string());
                if let Err(e) = self.settle(transaction_id, TransactionStatus::Dropped, None, message).await {
                    error!(error = %e, "Failed to drop transaction");
                }
                return;
            }

            let outcome = match provider.check_status(task_id).await {
                Ok(ProviderStatus::Pending) => continue,
                Ok(status) => self.apply_status(transaction_id, status, Utc::now()).await,
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Transient failure checking payment status");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Payment status check failed");
                    self.settle(transaction_id, e.transaction_status(), None, Some(e.to_string())).await
                }
            };
            if let Err(e) = outcome {
                error!(error = %e, "Failed to settle transaction");
            }
            return;
        }
    }

    /// Resume status checks of transactions left running by a previous process. Returns how
    /// many pollers were started.
    #[instrument(skip(self), err)]
    pub async fn resume_running(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let running = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            MoMoTransactions::new(&mut conn).list_running(now).await?
        };
        let mut resumed = 0;
        for transaction in running {
            let Some(task_id) = transaction.task_id.clone() else {
                let message = Some("Interrupted before the payment was submitted".to_string());
                self.settle(transaction.id, TransactionStatus::RequestException, None, message).await?;
                continue;
            };
            let provider = match self.resumed_provider(&transaction).await {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(error = %e, transaction_id = %transaction.id, "Cannot resume status checks");
                    self.settle(transaction.id, TransactionStatus::ApiError, None, Some(e.to_string())).await?;
                    continue;
                }
            };
            let elapsed = (now - transaction.created_at).to_std().unwrap_or_default();
            let remaining = provider.poll_timeout().saturating_sub(elapsed);
            self.spawn_poller(provider, transaction.id, task_id, Instant::now() + remaining);
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "Resumed mobile money status checks");
        }
        Ok(resumed)
    }

    async fn resumed_provider(&self, transaction: &TransactionDBResponse) -> Result<Arc<dyn MobileMoneyProvider>, Error> {
        let kind: ProviderKind = transaction.provider.parse().map_err(|e: MobileMoneyError| Error::BadRequest { message: e.to_string() })?;
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mean = PaymentMeans::new(&mut conn)
            .get_by_slug(transaction.service_id, kind.slug())
            .await?
            .ok_or_else(|| Error::BadRequest {
                message: format!("Payment mean {kind} no longer exists"),
            })?;
        self.provider(kind, &mean.credentials.0).map_err(|e| Error::BadRequest { message: e.to_string() })
    }
}
