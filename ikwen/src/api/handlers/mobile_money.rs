//! Mobile money collection: payment requests, their status, and operator notifications.

use crate::api::handlers::invoices::tenant_invoice;
use crate::api::models::billing::{MobileMoneyPaymentCreate, NotificationQuery, TransactionResponse};
use crate::api::models::members::CurrentUser;
use crate::auth::permissions::{can_read_all_resources, has_permission};
use crate::db::errors::DbError;
use crate::errors::{Error, Result};
use crate::mobile_money::ProviderKind;
use crate::types::{Operation, Permission, Resource, TransactionId};
use crate::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::debug;

fn parse_provider(slug: &str) -> Result<ProviderKind> {
    slug.parse().map_err(|_| Error::NotFound {
        resource: "Mobile money provider".to_string(),
        id: slug.to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/payments/mobile-money",
    tag = "billing",
    summary = "Pay an invoice by mobile money",
    description = "Sends a payment request to the subscriber's phone. The transaction stays pending until the \
                   operator reports a final status, or is dropped at the operator's deadline.",
    request_body = MobileMoneyPaymentCreate,
    responses(
        (status = 202, description = "Payment request submitted", body = TransactionResponse),
        (status = 400, description = "Invalid phone or provider not enabled"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Invoice not found"),
        (status = 409, description = "Invoice already paid or a payment is already running"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn start_mobile_money_payment(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(create): Json<MobileMoneyPaymentCreate>,
) -> Result<(StatusCode, Json<TransactionResponse>)> {
    let service_id = current_user.tenant()?;
    let kind: ProviderKind = create.provider.parse().map_err(|_| Error::BadRequest {
        message: format!("Unknown mobile money provider '{}'", create.provider),
    })?;
    {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        let invoice = tenant_invoice(&mut conn, service_id, create.invoice_id).await?;
        if invoice.member_id != Some(current_user.id) && !has_permission(&current_user, Resource::Payments, Operation::CreateAll) {
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(Resource::Payments, Operation::CreateAll),
                action: Operation::CreateAll,
                resource: format!("invoice {}", invoice.number),
            });
        }
    }

    let transaction = state
        .collector
        .start_payment(service_id, create.invoice_id, kind, &create.phone)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TransactionResponse::from(transaction))))
}

#[utoipa::path(
    get,
    path = "/payments/mobile-money/{id}",
    tag = "billing",
    summary = "Get mobile money transaction",
    params(("id" = uuid::Uuid, Path, description = "Transaction ID")),
    responses(
        (status = 200, description = "Transaction with its current status", body = TransactionResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Transaction not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_mobile_money_transaction(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
    current_user: CurrentUser,
) -> Result<Json<TransactionResponse>> {
    let service_id = current_user.tenant()?;
    let transaction = state.collector.transaction(service_id, id).await?;
    if !can_read_all_resources(&current_user, Resource::Payments) {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        let invoice = tenant_invoice(&mut conn, service_id, transaction.object_id).await?;
        if invoice.member_id != Some(current_user.id) {
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(Resource::Payments, Operation::ReadAll),
                action: Operation::ReadAll,
                resource: format!("transaction {id}"),
            });
        }
    }
    Ok(Json(TransactionResponse::from(transaction)))
}

#[utoipa::path(
    post,
    path = "/webhooks/mobile-money/{provider}/{transaction_id}",
    tag = "webhooks",
    summary = "Operator payment notification",
    description = "Called by MTN MoMo and Orange Money with the final status of a payment. The URL is signed \
                   per transaction. Notifications about settled transactions are acknowledged and ignored.",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("transaction_id" = uuid::Uuid, Path, description = "Transaction ID"),
        NotificationQuery,
    ),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Notification processed"),
        (status = 401, description = "Invalid signature"),
        (status = 404, description = "Unknown provider or transaction"),
    )
)]
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn mobile_money_notification(
    State(state): State<AppState>,
    Path((provider, transaction_id)): Path<(String, TransactionId)>,
    Query(query): Query<NotificationQuery>,
    body: Bytes,
) -> Result<StatusCode> {
    let kind = parse_provider(&provider)?;
    // Operators do not all send a JSON content type
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap_or_else(|e| {
        debug!(error = %e, "Notification body is not JSON");
        serde_json::Value::Null
    });
    state
        .collector
        .handle_notification(kind, transaction_id, &query.signature, &body, Utc::now())
        .await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::billing::InvoiceResponse;
    use crate::billing::cycle::BillingCycle;
    use crate::billing::status::{InvoiceStatus, SubscriptionStatus};
    use crate::db::handlers::{Invoices, PaymentMeans, Repository, Subscriptions};
    use crate::db::models::groups::COMMUNITY_GROUP;
    use crate::db::models::mobile_money::TransactionStatus;
    use crate::db::models::payments::PaymentMeanCreateDBRequest;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::mobile_money::signing::sign_transaction;
    use crate::test_utils::{add_to_group, authenticated, create_test_config, create_test_member, create_test_service, create_test_state};
    use crate::types::{InvoiceId, ServiceId};
    use axum::routing::{get, post};
    use axum_test::TestServer;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/payments/mobile-money", post(start_mobile_money_payment))
            .route("/payments/mobile-money/{id}", get(get_mobile_money_transaction))
            .route("/webhooks/mobile-money/{provider}/{transaction_id}", post(mobile_money_notification))
            .route("/invoices", post(crate::api::handlers::invoices::create_invoice))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    async fn enable_dummy(pool: &PgPool, service_id: ServiceId) {
        let mut conn = pool.acquire().await.unwrap();
        PaymentMeans::new(&mut conn)
            .create(&PaymentMeanCreateDBRequest {
                service_id,
                name: "Dummy".to_string(),
                slug: "dummy".to_string(),
                credentials: json!({}),
                is_active: true,
            })
            .await
            .unwrap();
    }

    async fn invoice_for(
        server: &TestServer,
        pool: &PgPool,
        owner: &crate::db::models::members::MemberDBResponse,
        service_id: ServiceId,
        member_id: crate::types::MemberId,
    ) -> InvoiceId {
        add_to_group(pool, service_id, COMMUNITY_GROUP, member_id).await;
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                service_id,
                member_id,
                product_id: None,
                monthly_cost: Decimal::new(5000, 0),
                billing_cycle: BillingCycle::Monthly,
                details: "Hosting".to_string(),
                expiry: NaiveDate::from_ymd_opt(2030, 1, 31),
                invoice_tolerance: 1,
                status: SubscriptionStatus::Active,
            })
            .await
            .unwrap();
        let invoice: InvoiceResponse = authenticated(server.post("/invoices"), owner, Some(service_id))
            .json(&json!({"subscription_id": subscription.id, "due_date": "2030-01-31"}))
            .await
            .json();
        invoice.id
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_notification_settles_invoice(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Host").await;
        let customer = create_test_member(&pool, "customer").await;
        enable_dummy(&pool, service.id).await;
        let server = server(pool.clone()).await;
        let invoice_id = invoice_for(&server, &pool, &owner, service.id, customer.id).await;

        let started = authenticated(server.post("/payments/mobile-money"), &customer, Some(service.id))
            .json(&json!({"invoice_id": invoice_id, "provider": "dummy", "phone": "+237 677 00 11 22"}))
            .await;
        started.assert_status(StatusCode::ACCEPTED);
        let transaction: TransactionResponse = started.json();
        assert_eq!(transaction.phone, "677001122");
        assert_eq!(transaction.amount, Decimal::new(5000, 0));

        // A second request for the same invoice is refused while the first runs
        if transaction.is_running {
            authenticated(server.post("/payments/mobile-money"), &customer, Some(service.id))
                .json(&json!({"invoice_id": invoice_id, "provider": "dummy", "phone": "677001122"}))
                .await
                .assert_status(StatusCode::CONFLICT);
        }

        let secret = create_test_config().secret_key.unwrap();
        server
            .post(&format!("/webhooks/mobile-money/dummy/{}", transaction.id))
            .add_query_param("signature", "forged")
            .json(&json!({}))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let signature = sign_transaction(&secret, &transaction.id).unwrap();
        server
            .post(&format!("/webhooks/mobile-money/dummy/{}", transaction.id))
            .add_query_param("signature", &signature)
            .json(&json!({}))
            .await
            .assert_status_ok();
        // Repeated notifications are acknowledged
        server
            .post(&format!("/webhooks/mobile-money/dummy/{}", transaction.id))
            .add_query_param("signature", &signature)
            .await
            .assert_status_ok();

        let settled: TransactionResponse =
            authenticated(server.get(&format!("/payments/mobile-money/{}", transaction.id)), &customer, Some(service.id))
                .await
                .json();
        assert_eq!(settled.status, TransactionStatus::Success);
        assert!(!settled.is_running);

        let mut conn = pool.acquire().await.unwrap();
        let invoice = Invoices::new(&mut conn).get_by_id(invoice_id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_disabled_provider_and_foreign_invoice(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Host").await;
        let alice = create_test_member(&pool, "alice").await;
        let bob = create_test_member(&pool, "bob").await;
        let server = server(pool.clone()).await;
        let invoice_id = invoice_for(&server, &pool, &owner, service.id, alice.id).await;
        add_to_group(&pool, service.id, COMMUNITY_GROUP, bob.id).await;

        authenticated(server.post("/payments/mobile-money"), &alice, Some(service.id))
            .json(&json!({"invoice_id": invoice_id, "provider": "dummy", "phone": "677001122"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        enable_dummy(&pool, service.id).await;
        authenticated(server.post("/payments/mobile-money"), &bob, Some(service.id))
            .json(&json!({"invoice_id": invoice_id, "provider": "dummy", "phone": "677001122"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        authenticated(server.post("/payments/mobile-money"), &alice, Some(service.id))
            .json(&json!({"invoice_id": invoice_id, "provider": "paypal", "phone": "677001122"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .post(&format!("/webhooks/mobile-money/paypal/{}", uuid::Uuid::new_v4()))
            .add_query_param("signature", "x")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
