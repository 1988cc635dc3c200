//! Mobile money collection.
//!
//! This module defines the [`MobileMoneyProvider`] trait which abstracts the operator APIs a
//! tenant collects invoice payments through:
//!
//! - [`mtn::MtnMomoProvider`]: MTN MoMo Open API (collection product)
//! - [`orange::OrangeMoneyProvider`]: Orange Money WSO2 merchant payment API
//! - [`dummy::DummyProvider`]: settles everything, for development
//!
//! Credentials are per tenant and stored on the tenant's [`PaymentMean`](crate::db::models::payments::PaymentMeanDBResponse).
//! A payment is a [`MoMoTransaction`](crate::db::models::mobile_money::TransactionDBResponse)
//! that stays running until the [`collector::Collector`] observes a final status, either by
//! polling the provider or through the provider's notification.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

use crate::config::MobileMoneyConfig;
use crate::db::models::mobile_money::TransactionStatus;
use crate::types::TransactionId;

pub mod collector;
pub mod dummy;
pub mod mtn;
pub mod orange;
pub mod signing;

pub use collector::Collector;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, MobileMoneyError>;

/// Failures talking to a mobile money operator.
///
/// Each variant maps to the final [`TransactionStatus`] of a transaction that fails with it.
/// Transient failures are worth another attempt.
#[derive(Debug, thiserror::Error)]
pub enum MobileMoneyError {
    #[error("Provider did not answer in time")]
    Timeout,

    #[error("TLS failure talking to provider: {0}")]
    Tls(String),

    #[error("Provider server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Request to provider failed: {0}")]
    Request(String),

    #[error("Payment rejected: {0}")]
    Rejected(String),
}

impl MobileMoneyError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MobileMoneyError::Timeout | MobileMoneyError::Server { .. } | MobileMoneyError::Request(_)
        )
    }

    /// Final status of a transaction that failed with this error
    pub fn transaction_status(&self) -> TransactionStatus {
        match self {
            MobileMoneyError::Timeout => TransactionStatus::Timeout,
            MobileMoneyError::Tls(_) => TransactionStatus::SslError,
            MobileMoneyError::Server { .. } => TransactionStatus::ServerError,
            MobileMoneyError::Api(_) => TransactionStatus::ApiError,
            MobileMoneyError::Request(_) => TransactionStatus::RequestException,
            MobileMoneyError::Rejected(_) => TransactionStatus::Failure,
        }
    }

    /// Error for a non-success HTTP answer
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status.is_server_error() {
            MobileMoneyError::Server {
                status: status.as_u16(),
                body,
            }
        } else {
            MobileMoneyError::Api(format!("HTTP {}: {body}", status.as_u16()))
        }
    }
}

impl From<reqwest::Error> for MobileMoneyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return MobileMoneyError::Timeout;
        }
        if err.is_decode() {
            return MobileMoneyError::Api(format!("unreadable provider response: {err}"));
        }
        if let Some(status) = err.status() {
            return MobileMoneyError::from_status(status, err.to_string());
        }
        // rustls errors surface somewhere in the source chain of a connect error
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            if let Some(tls) = cause.downcast_ref::<rustls::Error>() {
                return MobileMoneyError::Tls(tls.to_string());
            }
            source = cause.source();
        }
        MobileMoneyError::Request(err.to_string())
    }
}

/// Fail on a non-success answer, keeping the body for diagnostics
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MobileMoneyError::from_status(status, body))
}

/// Operators a tenant can collect payments through, identified by the slug of the payment mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    MtnMomo,
    OrangeMoney,
    Dummy,
}

impl ProviderKind {
    pub fn slug(&self) -> &'static str {
        match self {
            ProviderKind::MtnMomo => "mtn-momo",
            ProviderKind::OrangeMoney => "orange-money",
            ProviderKind::Dummy => "dummy",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ProviderKind {
    type Err = MobileMoneyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mtn-momo" => Ok(ProviderKind::MtnMomo),
            "orange-money" => Ok(ProviderKind::OrangeMoney),
            "dummy" => Ok(ProviderKind::Dummy),
            other => Err(MobileMoneyError::Api(format!("unknown mobile money provider '{other}'"))),
        }
    }
}

/// Create a provider for one tenant's payment mean.
///
/// This is the single point where a payment mean turns into a provider instance. Adding an
/// operator requires adding a match arm here.
pub fn create_provider(
    kind: ProviderKind,
    credentials: &serde_json::Value,
    config: &MobileMoneyConfig,
    client: reqwest::Client,
) -> Result<Box<dyn MobileMoneyProvider>> {
    match kind {
        ProviderKind::MtnMomo => {
            let credentials = parse_credentials(kind, credentials)?;
            Ok(Box::new(mtn::MtnMomoProvider::new(credentials, config.mtn.clone(), client)))
        }
        ProviderKind::OrangeMoney => {
            let credentials = parse_credentials(kind, credentials)?;
            Ok(Box::new(orange::OrangeMoneyProvider::new(credentials, config.orange.clone(), client)))
        }
        ProviderKind::Dummy if config.dummy_enabled => Ok(Box::new(dummy::DummyProvider)),
        ProviderKind::Dummy => Err(MobileMoneyError::Api("the dummy provider is disabled".to_string())),
    }
}

/// Check that credentials hold every field the provider needs, without contacting it
pub fn validate_credentials(kind: ProviderKind, credentials: &serde_json::Value) -> Result<()> {
    match kind {
        ProviderKind::MtnMomo => parse_credentials::<mtn::MtnCredentials>(kind, credentials).map(|_| ()),
        ProviderKind::OrangeMoney => parse_credentials::<orange::OrangeCredentials>(kind, credentials).map(|_| ()),
        ProviderKind::Dummy => Ok(()),
    }
}

fn parse_credentials<T: serde::de::DeserializeOwned>(kind: ProviderKind, credentials: &serde_json::Value) -> Result<T> {
    serde_json::from_value(credentials.clone()).map_err(|e| MobileMoneyError::Api(format!("invalid {kind} credentials: {e}")))
}

/// A payment to collect from a subscriber
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    /// Subscriber number in national form
    pub phone: String,
    /// Shown to the subscriber on their handset
    pub description: String,
    /// Where the operator posts the final status
    pub notify_url: String,
}

/// An accepted payment request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedPayment {
    /// Provider handle used to query the status
    pub task_id: String,
    pub processor_tx_id: Option<String>,
}

/// Status of a submitted payment as reported by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Succeeded { processor_tx_id: Option<String> },
    Failed { reason: String },
}

/// Abstract mobile money operator
#[async_trait]
pub trait MobileMoneyProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// How long a submitted payment may stay pending before it is dropped
    fn poll_timeout(&self) -> Duration;

    /// Ask the subscriber to approve a payment on their handset
    async fn request_payment(&self, request: &PaymentRequest) -> Result<SubmittedPayment>;

    /// Query the status of a submitted payment
    async fn check_status(&self, task_id: &str) -> Result<ProviderStatus>;
}

/// Submit a payment, retrying transient failures with exponential backoff
pub async fn submit_with_retry(
    provider: &dyn MobileMoneyProvider,
    request: &PaymentRequest,
    max_attempts: u32,
    backoff: Duration,
) -> Result<SubmittedPayment> {
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match provider.request_payment(request).await {
            Ok(submitted) => return Ok(submitted),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(provider = %provider.kind(), attempt, error = %e, "Transient failure submitting payment, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cameroonian MSISDN: a 9-digit national number gets the `237` country code
pub fn msisdn(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 9 { format!("237{digits}") } else { digits }
}

/// National form of a subscriber number, as stored on transactions
pub fn national_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix("237") {
        Some(national) if digits.len() == 12 => national.to_string(),
        _ => digits,
    }
}

/// OAuth access token shared by the calls of one provider instance
#[derive(Default)]
pub(crate) struct TokenCache {
    token: Mutex<Option<(String, Instant)>>,
}

/// Tokens are renewed this long before they expire
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

impl TokenCache {
    pub(crate) async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration)>>,
    {
        let mut guard = self.token.lock().await;
        if let Some((token, expires_at)) = guard.as_ref()
            && Instant::now() + TOKEN_MARGIN < *expires_at
        {
            return Ok(token.clone());
        }
        let (token, lifetime) = fetch().await?;
        *guard = Some((token.clone(), Instant::now() + lifetime));
        Ok(token)
    }
}
