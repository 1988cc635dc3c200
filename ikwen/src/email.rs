//! Email service for member and billing notifications.
//!
//! Every mail body is wrapped in the same HTML layout carrying the tenant's company name and
//! signature. Tenant-authored messages are trusted HTML; member-supplied values are escaped by
//! the caller through the template placeholders.

use chrono::{Datelike, Utc};
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use minijinja::{Environment, context};
use std::path::Path;

use crate::{
    config::{Config, EmailTransportConfig},
    errors::Error,
};

const LAYOUT: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{{ subject }}</title>
    <style>
        body { font-family: Arial, sans-serif; line-height: 1.6; color: #333; }
        .container { max-width: 600px; margin: 0 auto; padding: 20px; }
        .header { font-size: 20px; font-weight: bold; margin-bottom: 20px; }
        .footer { margin-top: 30px; font-size: 12px; color: #666; }
    </style>
</head>
<body>
    <div class="container">
        <div class="header">{{ company_name }}</div>
        <div class="message">{{ message | safe }}</div>
        {% if signature %}<div class="signature">{{ signature | safe }}</div>{% endif %}
        <div class="footer">
            <p>&copy; {{ year }} {{ company_name }}</p>
            <p>This is an automated message, please do not reply to this email.</p>
        </div>
    </div>
</body>
</html>"#;

/// Who a mail appears to come from
#[derive(Debug, Clone)]
pub struct Sender {
    pub name: String,
    pub email: String,
}

/// Fully rendered mail, ready to send
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
}

/// Wrap a message in the mail layout
pub fn render_layout(company_name: &str, subject: &str, message_html: &str, signature: &str) -> Result<String, Error> {
    let mut env = Environment::new();
    env.add_template("mail.html", LAYOUT).map_err(|e| Error::Internal {
        operation: format!("load mail layout: {e}"),
    })?;
    let template = env.get_template("mail.html").map_err(|e| Error::Internal {
        operation: format!("get mail layout: {e}"),
    })?;
    template
        .render(context! {
            company_name => company_name,
            subject => subject,
            message => message_html,
            signature => signature,
            year => Utc::now().year(),
        })
        .map_err(|e| Error::Internal {
            operation: format!("render mail layout: {e}"),
        })
}

pub struct EmailService {
    transport: EmailTransport,
    from_email: String,
    from_name: String,
    public_url: String,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

impl EmailService {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let email_config = &config.email;

        let transport = match &email_config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        Ok(Self {
            transport,
            from_email: email_config.from_email.clone(),
            from_name: email_config.from_name.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        })
    }

    /// Platform sender, used for account mails
    pub fn default_sender(&self) -> Sender {
        Sender {
            name: self.from_name.clone(),
            email: self.from_email.clone(),
        }
    }

    /// Sender of a tenant's mails: its company name, with the platform address unless the
    /// tenant has a contact address.
    pub fn tenant_sender(&self, company_name: &str, contact_email: Option<&str>) -> Sender {
        Sender {
            name: if company_name.is_empty() {
                self.from_name.clone()
            } else {
                company_name.to_string()
            },
            email: contact_email.filter(|e| !e.is_empty()).unwrap_or(&self.from_email).to_string(),
        }
    }

    pub async fn send_password_reset_email(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        token_id: &uuid::Uuid,
        token: &str,
    ) -> Result<(), Error> {
        let reset_link = format!("{}/reset-password?id={}&token={}", self.public_url, token_id, token);
        let subject = "Password Reset Request";
        let html = render_layout(&self.from_name, subject, &password_reset_message(to_name, &reset_link), "")?;
        self.send(
            &self.default_sender(),
            &OutgoingMail {
                to_email: to_email.to_string(),
                to_name: to_name.map(str::to_string),
                subject: subject.to_string(),
                html,
            },
        )
        .await
    }

    pub async fn send_welcome_email(&self, sender: &Sender, to_email: &str, first_name: &str, company_name: &str) -> Result<(), Error> {
        let subject = format!("Welcome to {company_name}");
        let message = format!(
            "<p>Hello {},</p><p>Your account on {} was created successfully. We are glad to have you with us.</p>",
            escape(first_name),
            escape(company_name)
        );
        let html = render_layout(company_name, &subject, &message, "")?;
        self.send(
            sender,
            &OutgoingMail {
                to_email: to_email.to_string(),
                to_name: Some(first_name.to_string()),
                subject,
                html,
            },
        )
        .await
    }

    pub async fn send(&self, sender: &Sender, mail: &OutgoingMail) -> Result<(), Error> {
        let from = format!("{} <{}>", sender.name, sender.email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Internal {
                operation: format!("parse from email: {e}"),
            })?;

        let to = match &mail.to_name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", mail.to_email),
            _ => mail.to_email.clone(),
        }
        .parse::<Mailbox>()
        .map_err(|e| Error::Internal {
            operation: format!("parse to email: {e}"),
        })?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(mail.html.clone())
            .map_err(|e| Error::Internal {
                operation: format!("build email message: {e}"),
            })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        Ok(())
    }
}

fn password_reset_message(to_name: Option<&str>, reset_link: &str) -> String {
    let greeting = match to_name {
        Some(name) => format!("Hello {},", escape(name)),
        None => "Hello,".to_string(),
    };
    format!(
        r#"<p>{greeting}</p>
<p>We received a request to reset your password. If you didn't make this request, you can safely ignore this email.</p>
<p>To reset your password, click the link below:</p>
<p><a href="{reset_link}">Reset your password</a></p>
<p>Or copy and paste this link into your browser:</p>
<p>{reset_link}</p>"#
    )
}

/// Minimal HTML escaping for values interpolated into mail bodies
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_config;

    #[tokio::test]
    async fn test_email_service_creation() {
        let config = create_test_config();
        assert!(EmailService::new(&config).is_ok());
    }

    #[test]
    fn test_layout_wraps_message() {
        let html = render_layout("Acme <Shop>", "Invoice", "<p>Pay <b>now</b></p>", "<i>The team</i>").unwrap();
        assert!(html.contains("Acme &lt;Shop&gt;"));
        assert!(html.contains("<p>Pay <b>now</b></p>"));
        assert!(html.contains("<i>The team</i>"));
        assert!(html.contains(&Utc::now().year().to_string()));
    }

    #[test]
    fn test_password_reset_message() {
        let body = password_reset_message(Some("John <Doe>"), "https://example.com/reset?token=abc123");
        assert!(body.contains("Hello John &lt;Doe&gt;,"));
        assert!(body.contains("https://example.com/reset?token=abc123"));
        assert!(password_reset_message(None, "x").contains("Hello,"));
    }

    #[test]
    fn test_tenant_sender_falls_back_to_platform() {
        let config = create_test_config();
        let service = EmailService::new(&config).unwrap();
        let sender = service.tenant_sender("Acme", None);
        assert_eq!(sender.name, "Acme");
        assert_eq!(sender.email, config.email.from_email);
        assert_eq!(service.tenant_sender("", Some("billing@acme.cm")).email, "billing@acme.cm");
    }

    #[tokio::test]
    async fn test_file_transport_writes_mail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config();
        config.email.transport = EmailTransportConfig::File {
            path: dir.path().to_string_lossy().to_string(),
        };
        let service = EmailService::new(&config).unwrap();
        service
            .send_welcome_email(&service.default_sender(), "jane@example.com", "Jane", "Acme")
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
