//! Outgoing SMS.
//!
//! Tenants deliver SMS either through an HTTP gateway, a GET on a URL template carrying
//! `$label`, `$recipient` and `$text`, or by queueing them for an external sender.

use sqlx::PgConnection;
use tracing::{debug, instrument};

use crate::config::SmsConfig;
use crate::db::handlers::{Events, services::slugify};
use crate::db::models::services::{ConfigDBResponse, SmsSendingMethod};
use crate::errors::Error;

/// Characters billed as one SMS
pub const SMS_PAGE_LENGTH: usize = 160;

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("SMS gateway is not configured")]
    NotConfigured,

    #[error("SMS gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("SMS gateway answered with status {0}")]
    Status(u16),

    #[error("failed to queue SMS: {0}")]
    Queue(#[from] crate::db::errors::DbError),
}

/// What happened to an SMS handed to [`SmsGateway::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsDelivery {
    Sent,
    Queued,
    /// The tenant does not send SMS
    Skipped,
}

/// Number of billed SMS for a text, at least one
pub fn count_pages(text: &str) -> i32 {
    let length = text.chars().count();
    length.div_ceil(SMS_PAGE_LENGTH).max(1) as i32
}

/// Sender label of a tenant: the configured label, or up to 11 characters of the company
/// name in CamelCase.
pub fn sms_label(config: &ConfigDBResponse) -> String {
    if let Some(label) = config.sms_label.as_deref().filter(|l| !l.trim().is_empty()) {
        return label.trim().to_string();
    }
    let mut name = config.company_name.trim();
    if name.chars().count() > 11 {
        let first = name.split(' ').next().unwrap_or(name);
        name = match first.char_indices().nth(11) {
            Some((index, _)) => &first[..index],
            None => first,
        };
    }
    slugify(name)
        .split('-')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let mut chars = token.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Fill a gateway URL template
pub fn render_gateway_url(template: &str, label: &str, recipient: &str, text: &str) -> String {
    template
        .replace("$label", &encode(label))
        .replace("$recipient", &encode(recipient))
        .replace("$text", &encode(text))
}

#[derive(Clone)]
pub struct SmsGateway {
    client: reqwest::Client,
}

impl SmsGateway {
    pub fn new(config: &SmsConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal {
                operation: format!("create SMS HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Submit one SMS through a gateway URL template
    #[instrument(skip(self, template, text), err)]
    pub async fn send(&self, template: &str, label: &str, recipient: &str, text: &str) -> Result<(), SmsError> {
        let url = render_gateway_url(template, label, recipient, text);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SmsError::Status(status.as_u16()));
        }
        let base_url = url.split('?').next().unwrap_or_default();
        debug!(recipient, base_url, "SMS submitted");
        Ok(())
    }

    /// Deliver an SMS the way the tenant is configured to
    #[instrument(skip(self, db, config, text), fields(method = ?config.sms_sending_method), err)]
    pub async fn deliver(&self, db: &mut PgConnection, config: &ConfigDBResponse, recipient: &str, text: &str) -> Result<SmsDelivery, SmsError> {
        if recipient.is_empty() || text.is_empty() {
            return Ok(SmsDelivery::Skipped);
        }
        match config.sms_sending_method {
            SmsSendingMethod::None => Ok(SmsDelivery::Skipped),
            SmsSendingMethod::HttpApi => {
                let template = config
                    .sms_api_script_url
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or(SmsError::NotConfigured)?;
                self.send(template, &sms_label(config), recipient, text).await?;
                Ok(SmsDelivery::Sent)
            }
            SmsSendingMethod::Queue => {
                Events::new(db).queue_sms(config.service_id, recipient, text).await?;
                Ok(SmsDelivery::Queued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tenant_config(method: SmsSendingMethod, url: Option<String>) -> ConfigDBResponse {
        ConfigDBResponse {
            service_id: Uuid::new_v4(),
            company_name: "Tchopetyamo Restaurant".to_string(),
            contact_email: None,
            currency_code: "XAF".to_string(),
            currency_symbol: "XAF".to_string(),
            decimal_precision: 0,
            sms_sending_method: method,
            sms_api_script_url: url,
            sms_label: None,
            register_with_email: false,
            signature: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_count_pages() {
        assert_eq!(count_pages(""), 1);
        assert_eq!(count_pages(&"a".repeat(160)), 1);
        assert_eq!(count_pages(&"a".repeat(161)), 2);
        assert_eq!(count_pages(&"a".repeat(480)), 3);
    }

    #[test]
    fn test_label_from_company_name() {
        let config = tenant_config(SmsSendingMethod::None, None);
        assert_eq!(sms_label(&config), "Tchopetyamo");

        let mut short = tenant_config(SmsSendingMethod::None, None);
        short.company_name = "Ma boutique".to_string();
        assert_eq!(sms_label(&short), "MaBoutique");

        short.sms_label = Some("SHOP".to_string());
        assert_eq!(sms_label(&short), "SHOP");
    }

    #[test]
    fn test_gateway_url_is_encoded() {
        let url = render_gateway_url(
            "https://sms.example.com/send?from=$label&to=$recipient&msg=$text",
            "My Shop",
            "237677000000",
            "Pay 5000 & win",
        );
        assert_eq!(url, "https://sms.example.com/send?from=My+Shop&to=237677000000&msg=Pay+5000+%26+win");
    }

    #[tokio::test]
    async fn test_send_hits_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/send"))
            .and(query_param("to", "677000000"))
            .and(query_param("msg", "Hello there"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        crate::test_utils::install_crypto_provider();
        let gateway = SmsGateway::new(&SmsConfig {
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let template = format!("{}/send?from=$label&to=$recipient&msg=$text", server.uri());
        gateway.send(&template, "Shop", "677000000", "Hello there").await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        crate::test_utils::install_crypto_provider();
        let gateway = SmsGateway::new(&SmsConfig::default()).unwrap();
        let template = format!("{}/send?to=$recipient&msg=$text", server.uri());
        let err = gateway.send(&template, "Shop", "677000000", "Hi").await.unwrap_err();
        assert!(matches!(err, SmsError::Status(503)));
    }

    #[sqlx::test]
    async fn test_deliver_by_method(pool: sqlx::PgPool) {
        crate::test_utils::install_crypto_provider();
        let gateway = SmsGateway::new(&SmsConfig::default()).unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let none = tenant_config(SmsSendingMethod::None, None);
        assert_eq!(gateway.deliver(&mut conn, &none, "677000000", "Hi").await.unwrap(), SmsDelivery::Skipped);

        let missing_url = tenant_config(SmsSendingMethod::HttpApi, None);
        assert!(matches!(
            gateway.deliver(&mut conn, &missing_url, "677000000", "Hi").await,
            Err(SmsError::NotConfigured)
        ));
    }
}
