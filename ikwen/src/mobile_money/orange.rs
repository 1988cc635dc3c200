//! Orange Money WSO2 merchant payment API.
//!
//! A payment takes two calls: `mp/init` hands out a pay token, `mp/pay` pushes the request to
//! the subscriber's handset. The pay token then identifies the payment for status queries and
//! notifications.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    MobileMoneyError, MobileMoneyProvider, PaymentRequest, ProviderKind, ProviderStatus, Result, SubmittedPayment, TokenCache,
    ensure_success, national_phone,
};
use crate::config::OrangeMoneyConfig;
use crate::db::models::mobile_money::TransactionDBResponse;
use crate::types::TransactionId;

/// Longest order id the API accepts
const ORDER_ID_LENGTH: usize = 20;

/// Credentials of a tenant's merchant account
#[derive(Debug, Clone, Deserialize)]
pub struct OrangeCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub api_username: String,
    pub api_password: String,
    #[serde(rename = "channelUserMsisdn")]
    pub channel_user_msisdn: String,
    #[serde(rename = "channelUserPin")]
    pub channel_user_pin: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    message: Option<String>,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitData {
    pay_token: String,
}

#[derive(Debug, Deserialize)]
struct PayData {
    inittxnstatus: Option<String>,
    txnid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
    txnid: Option<String>,
}

/// Order id derived from a transaction id: its first 20 hex digits
pub fn order_id(transaction_id: &TransactionId) -> String {
    transaction_id.simple().to_string().chars().take(ORDER_ID_LENGTH).collect()
}

pub struct OrangeMoneyProvider {
    credentials: OrangeCredentials,
    config: OrangeMoneyConfig,
    client: reqwest::Client,
    token: TokenCache,
}

impl OrangeMoneyProvider {
    pub fn new(credentials: OrangeCredentials, config: OrangeMoneyConfig, client: reqwest::Client) -> Self {
        Self {
            credentials,
            config,
            client,
            token: TokenCache::default(),
        }
    }

    fn host(&self) -> &str {
        self.config.base_url.as_str().trim_end_matches('/')
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}{}/{operation}", self.host(), self.config.api_path.trim_end_matches('/'))
    }

    fn auth_token(&self) -> String {
        BASE64_STANDARD.encode(format!("{}:{}", self.credentials.api_username, self.credentials.api_password))
    }

    async fn access_token(&self) -> Result<String> {
        self.token
            .get_or_fetch(|| async {
                debug!("Requesting Orange Money access token");
                let response = self
                    .client
                    .post(format!("{}/token", self.host()))
                    .basic_auth(&self.credentials.consumer_key, Some(&self.credentials.consumer_secret))
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body("grant_type=client_credentials")
                    .send()
                    .await?;
                let token: TokenResponse = ensure_success(response).await?.json().await?;
                Ok::<_, MobileMoneyError>((token.access_token, Duration::from_secs(token.expires_in.unwrap_or(3600))))
            })
            .await
    }

    async fn post(&self, operation: &str, body: Option<serde_json::Value>) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let mut builder = self
            .client
            .post(self.endpoint(operation))
            .bearer_auth(&token)
            .header("X-AUTH-TOKEN", self.auth_token());
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        ensure_success(builder.send().await?).await
    }
}

fn parse_status(data: StatusData, message: Option<String>) -> ProviderStatus {
    if data.status.to_lowercase().starts_with("success") {
        return ProviderStatus::Succeeded {
            processor_tx_id: data.txnid,
        };
    }
    match data.status.as_str() {
        "FAILED" => ProviderStatus::Failed {
            reason: message.unwrap_or(data.status),
        },
        // PENDING, INITIATED and whatever else the gateway reports before a final answer
        _ => ProviderStatus::Pending,
    }
}

/// Status carried by a payment notification, which must name this transaction's pay token
pub fn parse_notification(body: &serde_json::Value, transaction: &TransactionDBResponse) -> ProviderStatus {
    // A callback we cannot read leaves the transaction to the poller
    let Some(status) = body.get("status").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return ProviderStatus::Pending;
    };
    let pay_token = body.get("payToken").and_then(|v| v.as_str());
    if pay_token.is_none() || pay_token != transaction.task_id.as_deref() {
        return ProviderStatus::Failed {
            reason: format!("notification for another payment ({})", pay_token.unwrap_or_default()),
        };
    }
    if status.to_lowercase().starts_with("success") {
        ProviderStatus::Succeeded {
            processor_tx_id: body.get("txnid").and_then(|v| v.as_str()).map(str::to_string),
        }
    } else if status == "PENDING" {
        ProviderStatus::Pending
    } else {
        ProviderStatus::Failed { reason: status.to_string() }
    }
}

#[async_trait]
impl MobileMoneyProvider for OrangeMoneyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OrangeMoney
    }

    fn poll_timeout(&self) -> Duration {
        self.config.timeout
    }

    #[instrument(skip_all, fields(transaction_id = %request.transaction_id, amount = %request.amount), err)]
    async fn request_payment(&self, request: &PaymentRequest) -> Result<SubmittedPayment> {
        let init: Envelope<InitData> = self.post("mp/init", None).await?.json().await?;
        let pay_token = init.data.pay_token;

        let body = json!({
            "subscriberMsisdn": national_phone(&request.phone),
            "channelUserMsisdn": self.credentials.channel_user_msisdn,
            "pin": self.credentials.channel_user_pin,
            "amount": request.amount.round_dp(0).normalize().to_string(),
            "orderId": order_id(&request.transaction_id),
            "description": request.description,
            "payToken": pay_token,
            "notifUrl": request.notify_url,
        });
        let pay: Envelope<PayData> = self.post("mp/pay", Some(body)).await?.json().await?;
        if pay.data.inittxnstatus.as_deref() != Some("200") {
            return Err(MobileMoneyError::Api(
                pay.message.unwrap_or_else(|| "payment was not initiated".to_string()),
            ));
        }
        debug!("Payment pushed to subscriber");
        Ok(SubmittedPayment {
            task_id: pay_token,
            processor_tx_id: pay.data.txnid,
        })
    }

    #[instrument(skip(self), err)]
    async fn check_status(&self, task_id: &str) -> Result<ProviderStatus> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.endpoint(&format!("mp/paymentstatus/{task_id}")))
            .bearer_auth(&token)
            .header("X-AUTH-TOKEN", self.auth_token())
            .send()
            .await?;
        let status: Envelope<StatusData> = ensure_success(response).await?.json().await?;
        Ok(parse_status(status.data, status.message))
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
    use wiremock::matchers::{basic_auth, bearer_token, body_partial_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> OrangeCredentials {
        OrangeCredentials {
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            api_username: "merchant".to_string(),
            api_password: "secret".to_string(),
            channel_user_msisdn: "691000000".to_string(),
            channel_user_pin: "1234".to_string(),
        }
    }

    fn provider(server: &MockServer) -> OrangeMoneyProvider {
        crate::test_utils::install_crypto_provider();
        let config = OrangeMoneyConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            ..Default::default()
        };
        OrangeMoneyProvider::new(credentials(), config, reqwest::Client::new())
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(basic_auth("ck", "cs"))
            .and(body_string("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "om-token", "expires_in": 3600})))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_init(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/omcoreapis/1.0.2/mp/init"))
            .and(bearer_token("om-token"))
            .and(header("X-AUTH-TOKEN", BASE64_STANDARD.encode("merchant:secret").as_str()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"message": "Payment request successfully initiated", "data": {"payToken": "MP2403"}})),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            transaction_id: Uuid::new_v4(),
            amount: Decimal::from(5000),
            phone: "237699001122".to_string(),
            description: "Invoice A1/0324".to_string(),
            notify_url: "https://acme.example.com/webhooks/mobile-money/orange-money/1?signature=abc".to_string(),
        }
    }

    #[test]
    fn test_order_id_fits_the_api() {
        let id = Uuid::new_v4();
        let order = order_id(&id);
        assert_eq!(order.len(), 20);
        assert!(id.simple().to_string().starts_with(&order));
    }

    #[tokio::test]
    async fn test_payment_shape() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_init(&server).await;
        let request = request();

        Mock::given(method("POST"))
            .and(path("/omcoreapis/1.0.2/mp/pay"))
            .and(bearer_token("om-token"))
            .and(body_partial_json(json!({
                "subscriberMsisdn": "699001122",
                "channelUserMsisdn": "691000000",
                "pin": "1234",
                "amount": "5000",
                "orderId": order_id(&request.transaction_id),
                "payToken": "MP2403",
                "notifUrl": request.notify_url,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": "Paiement e la clientele done",
                "data": {"inittxnstatus": "200", "txnid": "MP240301.1200.A00001", "status": "PENDING"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let submitted = provider(&server).request_payment(&request).await.unwrap();
        assert_eq!(
            submitted,
            SubmittedPayment {
                task_id: "MP2403".to_string(),
                processor_tx_id: Some("MP240301.1200.A00001".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_payment_not_initiated() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_init(&server).await;
        Mock::given(method("POST"))
            .and(path("/omcoreapis/1.0.2/mp/pay"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"message": "Invalid subscriber", "data": {"inittxnstatus": "60019"}})),
            )
            .mount(&server)
            .await;

        let error = provider(&server).request_payment(&request()).await.unwrap_err();
        assert_eq!(error.transaction_status(), TransactionStatus::ApiError);
        assert!(error.to_string().contains("Invalid subscriber"));
    }

    #[tokio::test]
    async fn test_status_parsing() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        for (token, body) in [
            ("pending", json!({"message": "", "data": {"status": "PENDING"}})),
            ("paid", json!({"message": "", "data": {"status": "SUCCESSFULL", "txnid": "MP1"}})),
            ("failed", json!({"message": "Subscriber cancelled", "data": {"status": "FAILED"}})),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("/omcoreapis/1.0.2/mp/paymentstatus/{token}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
        }

        let provider = provider(&server);
        assert_eq!(provider.check_status("pending").await.unwrap(), ProviderStatus::Pending);
        assert_eq!(
            provider.check_status("paid").await.unwrap(),
            ProviderStatus::Succeeded {
                processor_tx_id: Some("MP1".to_string())
            }
        );
        assert_eq!(
            provider.check_status("failed").await.unwrap(),
            ProviderStatus::Failed {
                reason: "Subscriber cancelled".to_string()
            }
        );
    }

    #[test]
    fn test_notification_matches_pay_token() {
        let tx = TransactionDBResponse {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            provider: "orange-money".to_string(),
            wallet: "orange-money".to_string(),
            phone: "699001122".to_string(),
            amount: Decimal::from(5000),
            model: "billing.Invoice".to_string(),
            object_id: Uuid::new_v4(),
            processor_tx_id: Some("MP1".to_string()),
            task_id: Some("MP2403".to_string()),
            callback: "confirm_invoice_payment".to_string(),
            message: None,
            is_running: true,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            parse_notification(&json!({"status": "SUCCESSFULL", "payToken": "MP2403"}), &tx),
            ProviderStatus::Succeeded { processor_tx_id: None }
        );
        assert!(matches!(
            parse_notification(&json!({"status": "SUCCESSFULL", "payToken": "MP9999"}), &tx),
            ProviderStatus::Failed { .. }
        ));
        assert_eq!(
            parse_notification(&json!({"status": "FAILED", "payToken": "MP2403"}), &tx),
            ProviderStatus::Failed {
                reason: "FAILED".to_string()
            }
        );
        // Garbled callbacks are ignored, the poller settles the payment
        assert_eq!(parse_notification(&serde_json::Value::Null, &tx), ProviderStatus::Pending);
        assert_eq!(parse_notification(&json!({"payToken": "MP2403"}), &tx), ProviderStatus::Pending);
    }
}
