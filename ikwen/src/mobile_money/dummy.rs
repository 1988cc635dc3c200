//! Dummy mobile money provider
//!
//! Accepts every payment request and reports it successful on the first status check. Only
//! available when `mobile_money.dummy_enabled` is set.

use std::time::Duration;

use async_trait::async_trait;

use super::{MobileMoneyProvider, PaymentRequest, ProviderKind, ProviderStatus, Result, SubmittedPayment};

pub struct DummyProvider;

#[async_trait]
impl MobileMoneyProvider for DummyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dummy
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn request_payment(&self, request: &PaymentRequest) -> Result<SubmittedPayment> {
        tracing::info!("Dummy provider accepted payment {} of {}", request.transaction_id, request.amount);
        Ok(SubmittedPayment {
            task_id: format!("dummy_{}", request.transaction_id.simple()),
            processor_tx_id: None,
        })
    }

    async fn check_status(&self, task_id: &str) -> Result<ProviderStatus> {
        Ok(ProviderStatus::Succeeded {
            processor_tx_id: Some(task_id.to_string()),
        })
    }
}
