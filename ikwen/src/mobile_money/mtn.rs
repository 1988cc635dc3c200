//! MTN MoMo Open API, collection product.
//!
//! A payment is a "request to pay" identified by the `X-Reference-Id` we choose. We use the
//! transaction id, so a retried submission of the same transaction cannot charge twice: MTN
//! answers 409 to a reference it already knows.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    MobileMoneyError, MobileMoneyProvider, PaymentRequest, ProviderKind, ProviderStatus, Result, SubmittedPayment, TokenCache, ensure_success,
    msisdn,
};
use crate::config::MtnMomoConfig;
use crate::db::models::mobile_money::TransactionDBResponse;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Credentials of a tenant's collection subscription
#[derive(Debug, Clone, Deserialize)]
pub struct MtnCredentials {
    pub api_user: String,
    pub api_key: String,
    pub subscription_key: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestToPayResult {
    status: String,
    financial_transaction_id: Option<String>,
    reason: Option<serde_json::Value>,
}

pub struct MtnMomoProvider {
    credentials: MtnCredentials,
    config: MtnMomoConfig,
    base_url: String,
    client: reqwest::Client,
    token: TokenCache,
}

impl MtnMomoProvider {
    pub fn new(credentials: MtnCredentials, config: MtnMomoConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url(),
            credentials,
            config,
            client,
            token: TokenCache::default(),
        }
    }

    fn target_environment(&self) -> &str {
        if self.config.sandbox { "sandbox" } else { &self.config.target_environment }
    }

    fn currency(&self) -> &str {
        if self.config.sandbox { "EUR" } else { &self.config.currency }
    }

    async fn access_token(&self) -> Result<String> {
        self.token
            .get_or_fetch(|| async {
                debug!("Requesting MTN MoMo collection token");
                let response = self
                    .client
                    .post(format!("{}/collection/token/", self.base_url))
                    .basic_auth(&self.credentials.api_user, Some(&self.credentials.api_key))
                    .header(SUBSCRIPTION_KEY_HEADER, self.credentials.subscription_key.trim())
                    .send()
                    .await?;
                let token: TokenResponse = ensure_success(response).await?.json().await?;
                Ok::<_, MobileMoneyError>((token.access_token, Duration::from_secs(token.expires_in.unwrap_or(3600))))
            })
            .await
    }
}

fn reason_message(reason: Option<&serde_json::Value>) -> Option<String> {
    match reason? {
        serde_json::Value::String(message) => Some(message.clone()),
        serde_json::Value::Object(fields) => fields
            .get("message")
            .or_else(|| fields.get("code"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn parse_status(result: RequestToPayResult) -> ProviderStatus {
    match result.status.as_str() {
        "PENDING" => ProviderStatus::Pending,
        "SUCCESSFUL" => ProviderStatus::Succeeded {
            processor_tx_id: result.financial_transaction_id,
        },
        other => ProviderStatus::Failed {
            reason: reason_message(result.reason.as_ref()).unwrap_or_else(|| other.to_string()),
        },
    }
}

/// Status carried by a request-to-pay callback. Only a callback about this very transaction
/// can settle it.
pub fn parse_notification(body: &serde_json::Value, transaction: &TransactionDBResponse) -> ProviderStatus {
    // A callback we cannot read leaves the transaction to the poller
    let Some(status) = body.get("status").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return ProviderStatus::Pending;
    };
    let external_id = body.get("externalId").and_then(|v| v.as_str()).unwrap_or_default();
    match status {
        "PENDING" => ProviderStatus::Pending,
        "SUCCESSFUL" if external_id == transaction.id.to_string() => ProviderStatus::Succeeded {
            processor_tx_id: body.get("financialTransactionId").and_then(|v| v.as_str()).map(str::to_string),
        },
        "SUCCESSFUL" => ProviderStatus::Failed {
            reason: format!("notification for another payment ({external_id})"),
        },
        other => ProviderStatus::Failed {
            reason: reason_message(body.get("reason")).unwrap_or_else(|| other.to_string()),
        },
    }
}

#[async_trait]
impl MobileMoneyProvider for MtnMomoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MtnMomo
    }

    fn poll_timeout(&self) -> Duration {
        self.config.timeout
    }

    #[instrument(skip_all, fields(transaction_id = %request.transaction_id, amount = %request.amount), err)]
    async fn request_payment(&self, request: &PaymentRequest) -> Result<SubmittedPayment> {
        let token = self.access_token().await?;
        let reference_id = request.transaction_id.to_string();
        let amount = request.amount.round_dp(0).normalize().to_string();
        let payer = msisdn(&request.phone);
        let body = json!({
            "amount": amount,
            "currency": self.currency(),
            "externalId": reference_id,
            "payer": {"partyIdType": "MSISDN", "partyId": payer},
            "payerMessage": request.description,
            "payeeNote": format!("{}: {amount} from {payer}", request.description),
        });

        let mut builder = self
            .client
            .post(format!("{}/collection/v1_0/requesttopay", self.base_url))
            .bearer_auth(&token)
            .header("X-Reference-Id", &reference_id)
            .header("X-Target-Environment", self.target_environment())
            .header(SUBSCRIPTION_KEY_HEADER, self.credentials.subscription_key.trim())
            .json(&body);
        // The sandbox does not call back
        if !self.config.sandbox {
            builder = builder.header("X-Callback-Url", &request.notify_url);
        }

        let response = builder.send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Request to pay already submitted");
        } else {
            ensure_success(response).await?;
        }
        debug!("Request to pay submitted");
        Ok(SubmittedPayment {
            task_id: reference_id,
            processor_tx_id: None,
        })
    }

    #[instrument(skip(self), err)]
    async fn check_status(&self, task_id: &str) -> Result<ProviderStatus> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/collection/v1_0/requesttopay/{task_id}", self.base_url))
            .bearer_auth(&token)
            .header("X-Target-Environment", self.target_environment())
            .header(SUBSCRIPTION_KEY_HEADER, self.credentials.subscription_key.trim())
            .send()
            .await?;
        let result: RequestToPayResult = ensure_success(response).await?.json().await?;
        Ok(parse_status(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::mobile_money::TransactionStatus;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{basic_auth, bearer_token, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> MtnCredentials {
        MtnCredentials {
            api_user: "api-user".to_string(),
            api_key: "api-key".to_string(),
            subscription_key: "sub-key".to_string(),
        }
    }

    fn provider(server: &MockServer, sandbox: bool) -> MtnMomoProvider {
        crate::test_utils::install_crypto_provider();
        let config = MtnMomoConfig {
            sandbox,
            base_url: Some(Url::parse(&server.uri()).unwrap()),
            ..Default::default()
        };
        MtnMomoProvider::new(credentials(), config, reqwest::Client::new())
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/collection/token/"))
            .and(basic_auth("api-user", "api-key"))
            .and(header("Ocp-Apim-Subscription-Key", "sub-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "token-1",
                "token_type": "access_token",
                "expires_in": 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            transaction_id: Uuid::new_v4(),
            amount: Decimal::new(500000, 2),
            phone: "677001122".to_string(),
            description: "Invoice A1/0324".to_string(),
            notify_url: "https://acme.example.com/webhooks/mobile-money/mtn-momo/1?signature=abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_to_pay_shape() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        let request = request();

        Mock::given(method("POST"))
            .and(path("/collection/v1_0/requesttopay"))
            .and(bearer_token("token-1"))
            .and(header("X-Reference-Id", request.transaction_id.to_string().as_str()))
            .and(header("X-Target-Environment", "mtncameroon"))
            .and(header("Ocp-Apim-Subscription-Key", "sub-key"))
            .and(header("X-Callback-Url", request.notify_url.as_str()))
            .and(body_partial_json(json!({
                "amount": "5000",
                "currency": "XAF",
                "externalId": request.transaction_id.to_string(),
                "payer": {"partyIdType": "MSISDN", "partyId": "237677001122"}
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let submitted = provider(&server, false).request_payment(&request).await.unwrap();
        assert_eq!(submitted.task_id, request.transaction_id.to_string());
    }

    #[tokio::test]
    async fn test_sandbox_uses_eur() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/collection/v1_0/requesttopay"))
            .and(header("X-Target-Environment", "sandbox"))
            .and(body_partial_json(json!({"currency": "EUR"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server, true).request_payment(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_reference_counts_as_submitted() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/collection/v1_0/requesttopay"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        assert!(provider(&server, false).request_payment(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_submission_errors() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/collection/v1_0/requesttopay"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collection/v1_0/requesttopay"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let provider = provider(&server, false);
        let first = provider.request_payment(&request()).await.unwrap_err();
        assert!(matches!(first, MobileMoneyError::Server { status: 500, .. }));
        let second = provider.request_payment(&request()).await.unwrap_err();
        assert_eq!(second.transaction_status(), TransactionStatus::ApiError);
    }

    #[tokio::test]
    async fn test_status_parsing_reuses_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        for (reference, body) in [
            ("pending", json!({"status": "PENDING"})),
            ("paid", json!({"status": "SUCCESSFUL", "financialTransactionId": "FT-42"})),
            (
                "refused",
                json!({"status": "FAILED", "reason": {"code": "NOT_ENOUGH_FUNDS", "message": "Not enough funds"}}),
            ),
            ("odd", json!({"status": "REJECTED"})),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("/collection/v1_0/requesttopay/{reference}")))
                .and(bearer_token("token-1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
        }

        let provider = provider(&server, false);
        assert_eq!(provider.check_status("pending").await.unwrap(), ProviderStatus::Pending);
        assert_eq!(
            provider.check_status("paid").await.unwrap(),
            ProviderStatus::Succeeded {
                processor_tx_id: Some("FT-42".to_string())
            }
        );
        assert_eq!(
            provider.check_status("refused").await.unwrap(),
            ProviderStatus::Failed {
                reason: "Not enough funds".to_string()
            }
        );
        assert_eq!(
            provider.check_status("odd").await.unwrap(),
            ProviderStatus::Failed {
                reason: "REJECTED".to_string()
            }
        );
    }

    fn transaction() -> TransactionDBResponse {
        TransactionDBResponse {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            provider: "mtn-momo".to_string(),
            wallet: "mtn-momo".to_string(),
            phone: "677001122".to_string(),
            amount: Decimal::from(5000),
            model: "billing.Invoice".to_string(),
            object_id: Uuid::new_v4(),
            processor_tx_id: None,
            task_id: None,
            callback: "confirm_invoice_payment".to_string(),
            message: None,
            is_running: true,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_notification_must_match_transaction() {
        let tx = transaction();
        let ours = json!({"status": "SUCCESSFUL", "externalId": tx.id.to_string(), "financialTransactionId": "FT-1"});
        assert_eq!(
            parse_notification(&ours, &tx),
            ProviderStatus::Succeeded {
                processor_tx_id: Some("FT-1".to_string())
            }
        );
        let other = json!({"status": "SUCCESSFUL", "externalId": "someone-else"});
        assert!(matches!(parse_notification(&other, &tx), ProviderStatus::Failed { .. }));
        let failed = json!({"status": "FAILED", "reason": "PAYER_NOT_FOUND"});
        assert_eq!(
            parse_notification(&failed, &tx),
            ProviderStatus::Failed {
                reason: "PAYER_NOT_FOUND".to_string()
            }
        );
    }

    #[test]
    fn test_unreadable_notification_keeps_polling() {
        let tx = transaction();
        assert_eq!(parse_notification(&serde_json::Value::Null, &tx), ProviderStatus::Pending);
        assert_eq!(parse_notification(&json!({"externalId": tx.id.to_string()}), &tx), ProviderStatus::Pending);
        assert_eq!(parse_notification(&json!({"status": ""}), &tx), ProviderStatus::Pending);
    }
}
