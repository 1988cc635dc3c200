//! Test utilities for integration testing.

use std::sync::Arc;

use axum_test::{TestRequest, TestServer};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    AppState,
    auth::{session, utils::compose_full_name},
    billing::cycle::BillingCycle,
    config::{Config, EmailTransportConfig, LeaderElectionConfig, PoolSettings},
    db::{
        handlers::{Groups, Members, Repository, Services, services::slugify},
        models::{
            members::{MemberCreateDBRequest, MemberDBResponse},
            services::{ServiceCreateDBRequest, ServiceDBResponse, ServiceStatus, ServiceVersion},
        },
        router::DbRouter,
    },
    email::EmailService,
    notifier::Notifier,
    sms::SmsGateway,
    types::{MemberId, ServiceId},
};

pub async fn create_test_app(pool: PgPool) -> (TestServer, crate::BackgroundServices) {
    let config = create_test_config();

    let app = crate::Application::new_with_pool(config, Some(pool))
        .await
        .expect("Failed to create application");

    app.into_test_server()
}

static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

/// Install the process-wide rustls provider that `main` installs in production. HTTP and
/// SMTP clients panic on construction without it.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Already installed elsewhere in this process
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

pub fn create_test_config() -> Config {
    install_crypto_provider();

    // Use temp directory for test emails
    let temp_dir = std::env::temp_dir().join(format!("ikwen-test-emails-{}", std::process::id()));

    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_email: "admin@test.com".to_string(),
        admin_password: None,
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        enable_metrics: false,
        enable_request_logging: false,
        ..Default::default()
    };
    config.database.url = "Something".to_string();
    config.database.pool = PoolSettings {
        max_connections: 2,
        min_connections: 0,
        ..Default::default()
    };
    config.email.transport = EmailTransportConfig::File {
        path: temp_dir.to_string_lossy().to_string(),
    };
    config.auth.native.session.cookie_secure = false;
    // Cheap hashes keep the suite fast
    config.auth.native.password.argon2_memory_kib = 1024;
    config.auth.native.password.argon2_iterations = 1;
    config.mobile_money.dummy_enabled = true;
    config.background_services.leader_election = LeaderElectionConfig { enabled: false };
    config.background_services.billing.enabled = false;
    config.background_services.revival.enabled = false;
    config
}

pub fn create_test_notifier() -> Notifier {
    let config = create_test_config();
    let email = EmailService::new(&config).expect("Failed to create email service");
    let sms = SmsGateway::new(&config.sms).expect("Failed to create SMS gateway");
    Notifier::new(Arc::new(email), sms, TaskTracker::new())
}

pub async fn create_test_state(pool: PgPool) -> AppState {
    AppState::new(DbRouter::new(pool), create_test_config(), CancellationToken::new()).expect("Failed to create app state")
}

/// Create an active member. `name` is used as the username, and as the email when it
/// looks like one.
pub async fn create_test_member(pool: &PgPool, name: &str) -> MemberDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let email = if name.contains('@') {
        name.to_string()
    } else {
        format!("{name}@example.com")
    };
    let first_name = name.split('@').next().unwrap_or(name).to_string();

    Members::new(&mut conn)
        .create(&MemberCreateDBRequest {
            username: name.to_lowercase(),
            email: Some(email),
            full_name: compose_full_name(&first_name, "Test"),
            first_name,
            last_name: "Test".to_string(),
            ..Default::default()
        })
        .await
        .expect("Failed to create test member")
}

/// Create a service owned by `owner_id`, with its config, invoicing config and reserved groups
pub async fn create_test_service(pool: &PgPool, owner_id: MemberId, name: &str) -> ServiceDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let slug = slugify(name);

    Services::new(&mut conn)
        .create(&ServiceCreateDBRequest {
            member_id: owner_id,
            project_name: name.to_string(),
            project_name_slug: slug.clone(),
            database: "default".to_string(),
            domain: format!("{slug}.example.com"),
            url: format!("https://{slug}.example.com"),
            api_signature: format!("sig-{slug}"),
            billing_cycle: BillingCycle::Monthly,
            version: ServiceVersion::Full,
            status: ServiceStatus::Active,
            monthly_cost: Decimal::new(5000, 0),
            expiry: None,
            company_name: name.to_string(),
            contact_email: Some(format!("contact@{slug}.example.com")),
        })
        .await
        .expect("Failed to create test service")
}

/// Session cookie and tenant header of a member
pub fn add_auth_headers(member: &MemberDBResponse, service_id: Option<ServiceId>) -> Vec<(String, String)> {
    let config = create_test_config();
    let token = session::create_session_token(member, &config).expect("Failed to create session token");
    let mut headers = vec![(
        "cookie".to_string(),
        format!("{}={token}", config.auth.native.session.cookie_name),
    )];
    if let Some(service_id) = service_id {
        headers.push((crate::auth::current_user::SERVICE_HEADER.to_string(), service_id.to_string()));
    }
    headers
}

/// Attach [`add_auth_headers`] to a test request
pub fn authenticated(request: TestRequest, member: &MemberDBResponse, service_id: Option<ServiceId>) -> TestRequest {
    add_auth_headers(member, service_id)
        .into_iter()
        .fold(request, |request, (name, value)| request.add_header(name, value))
}

/// Put a member in a service's group by name
pub async fn add_to_group(pool: &PgPool, service_id: ServiceId, group: &str, member_id: MemberId) {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Groups::new(&mut conn)
        .add_member_to_named(service_id, group, member_id)
        .await
        .expect("Failed to add member to group");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_allows_tls_clients() {
        let config = create_test_config();
        assert!(SmsGateway::new(&config.sms).is_ok());
        assert!(reqwest::Client::builder().build().is_ok());
        // Installing again is harmless
        install_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }
}
