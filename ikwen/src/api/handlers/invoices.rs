use crate::api::models::billing::{InvoiceCreate, InvoiceResponse, ListInvoicesQuery, PaymentCreate, PaymentReceipt, PaymentResponse};
use crate::api::models::members::CurrentUser;
use crate::api::models::pagination::PaginatedResponse;
use crate::auth::permissions::{RequiresPermission, can_read_all_resources, operation, resource};
use crate::billing::payments::ManualInvoice;
use crate::db::errors::DbError;
use crate::db::handlers::{Invoices, Payments, Repository, invoices::InvoiceFilter};
use crate::db::models::invoices::InvoiceDBResponse;
use crate::errors::{Error, Result};
use crate::types::{InvoiceId, Operation, Permission, Resource, ServiceId, abbrev_uuid};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use sqlx::PgConnection;
use tracing::info;

pub(crate) async fn tenant_invoice(conn: &mut PgConnection, service_id: ServiceId, invoice_id: InvoiceId) -> Result<InvoiceDBResponse> {
    Invoices::new(conn)
        .get_by_id(invoice_id)
        .await?
        .filter(|i| i.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Invoice".to_string(),
            id: invoice_id.to_string(),
        })
}

/// Members read their own invoices, staff need read access to `resource`
fn require_invoice_access(user: &CurrentUser, invoice: &InvoiceDBResponse, resource: Resource) -> Result<()> {
    if invoice.member_id == Some(user.id) || can_read_all_resources(user, resource) {
        return Ok(());
    }
    Err(Error::InsufficientPermissions {
        required: Permission::Allow(resource, Operation::ReadAll),
        action: Operation::ReadAll,
        resource: format!("invoice {}", invoice.number),
    })
}

#[utoipa::path(
    get,
    path = "/invoices",
    tag = "billing",
    summary = "List invoices",
    description = "Staff with read access see every invoice of the service, other members only their own.",
    params(ListInvoicesQuery),
    responses(
        (status = 200, description = "Invoices, newest first", body = PaginatedResponse<InvoiceResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<InvoiceResponse>>> {
    let service_id = current_user.tenant()?;
    let list_query = query.to_list_query();
    let mut filter = InvoiceFilter::new(service_id, list_query.clone());
    filter.member_id = if can_read_all_resources(&current_user, Resource::Invoices) {
        query.member_id
    } else {
        Some(current_user.id)
    };
    filter.subscription_id = query.subscription_id;
    filter.status = query.status;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Invoices::new(&mut conn);
    let invoices = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        invoices.into_iter().map(InvoiceResponse::from).collect(),
        total_count,
        list_query.skip,
        list_query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/invoices",
    tag = "billing",
    summary = "Issue an invoice",
    description = "Invoices issued by staff are numbered with the M prefix.",
    request_body = InvoiceCreate,
    responses(
        (status = 201, description = "Invoice created", body = InvoiceResponse),
        (status = 400, description = "Invalid amount"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Subscription not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_invoice(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Invoices, operation::CreateAll>,
    Json(create): Json<InvoiceCreate>,
) -> Result<(StatusCode, Json<InvoiceResponse>)> {
    let service_id = current_user.tenant()?;
    let invoice = state
        .payer
        .create_manual_invoice(service_id, &ManualInvoice::from(create), Utc::now())
        .await?;
    info!(number = %invoice.number, "Manual invoice issued");
    Ok((StatusCode::CREATED, Json(InvoiceResponse::from(invoice))))
}

#[utoipa::path(
    get,
    path = "/invoices/{id}",
    tag = "billing",
    summary = "Get invoice",
    params(("id" = uuid::Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Invoice", body = InvoiceResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Invoice not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
    current_user: CurrentUser,
) -> Result<Json<InvoiceResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let invoice = tenant_invoice(&mut conn, service_id, id).await?;
    require_invoice_access(&current_user, &invoice, Resource::Invoices)?;
    Ok(Json(InvoiceResponse::from(invoice)))
}

#[utoipa::path(
    get,
    path = "/invoices/{id}/payments",
    tag = "billing",
    summary = "List invoice payments",
    params(("id" = uuid::Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Payments of the invoice", body = [PaymentResponse]),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Invoice not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_invoice_payments(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
    current_user: CurrentUser,
) -> Result<Json<Vec<PaymentResponse>>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let invoice = tenant_invoice(&mut conn, service_id, id).await?;
    require_invoice_access(&current_user, &invoice, Resource::Payments)?;
    let payments = Payments::new(&mut conn).list_for_invoice(id).await?;
    Ok(Json(payments.into_iter().map(PaymentResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/invoices/{id}/payments",
    tag = "billing",
    summary = "Record a payment",
    description = "Partial payments are accepted. The invoice is paid and the subscription extended once the \
                   balance is covered. Payments above the balance due are rejected.",
    params(("id" = uuid::Uuid, Path, description = "Invoice ID")),
    request_body = PaymentCreate,
    responses(
        (status = 201, description = "Payment recorded", body = PaymentReceipt),
        (status = 400, description = "Amount is not positive or exceeds the balance due"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Invoice not found"),
        (status = 409, description = "Invoice already paid"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
    current_user: RequiresPermission<resource::Payments, operation::CreateAll>,
    Json(create): Json<PaymentCreate>,
) -> Result<(StatusCode, Json<PaymentReceipt>)> {
    let service_id = current_user.tenant()?;
    {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        tenant_invoice(&mut conn, service_id, id).await?;
    }
    let (invoice, payment) = state
        .payer
        .record_payment(id, create.amount, create.method, Some(current_user.id), Utc::now())
        .await?;
    info!(invoice_id = %abbrev_uuid(&id), amount = %payment.amount, "Payment recorded");
    Ok((
        StatusCode::CREATED,
        Json(PaymentReceipt {
            invoice: InvoiceResponse::from(invoice),
            payment: PaymentResponse::from(payment),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/invoices/{id}/wallet-payment",
    tag = "billing",
    summary = "Pay from wallet balance",
    description = "Settles the balance due from the service's operator wallets, richest first.",
    params(("id" = uuid::Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Invoice paid", body = InvoiceResponse),
        (status = 400, description = "Wallet balance too low"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Invoice not found"),
        (status = 409, description = "Invoice already paid"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn pay_with_wallet_balance(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
    current_user: RequiresPermission<resource::Payments, operation::CreateAll>,
) -> Result<Json<InvoiceResponse>> {
    let service_id = current_user.tenant()?;
    {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        tenant_invoice(&mut conn, service_id, id).await?;
    }
    let invoice = state.payer.pay_with_wallet_balance(id, Utc::now()).await?;
    Ok(Json(InvoiceResponse::from(invoice)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cycle::BillingCycle;
    use crate::billing::status::{InvoiceStatus, SubscriptionStatus};
    use crate::db::handlers::Subscriptions;
    use crate::db::models::groups::COMMUNITY_GROUP;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::test_utils::{add_to_group, authenticated, create_test_member, create_test_service, create_test_state};
    use crate::types::SubscriptionId;
    use axum::routing::{get, post};
    use axum_test::TestServer;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/invoices", get(list_invoices).post(create_invoice))
            .route("/invoices/{id}", get(get_invoice))
            .route("/invoices/{id}/payments", get(list_invoice_payments).post(record_payment))
            .route("/invoices/{id}/wallet-payment", post(pay_with_wallet_balance))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    async fn subscribe(pool: &PgPool, service_id: ServiceId, member_id: crate::types::MemberId) -> SubscriptionId {
        add_to_group(pool, service_id, COMMUNITY_GROUP, member_id).await;
        let mut conn = pool.acquire().await.unwrap();
        Subscriptions::new(&mut conn)
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
            .unwrap()
            .id
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_manual_invoice_and_partial_payments(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Host").await;
        let customer = create_test_member(&pool, "customer").await;
        let subscription_id = subscribe(&pool, service.id, customer.id).await;
        let server = server(pool).await;

        let created = authenticated(server.post("/invoices"), &owner, Some(service.id))
            .json(&json!({"subscription_id": subscription_id, "months_count": 2, "due_date": "2030-01-31"}))
            .await;
        created.assert_status(StatusCode::CREATED);
        let invoice: InvoiceResponse = created.json();
        assert!(invoice.number.starts_with('M'));
        assert_eq!(invoice.amount, Decimal::new(10000, 0));
        assert_eq!(invoice.status, InvoiceStatus::Pending);

        let receipt: PaymentReceipt = authenticated(server.post(&format!("/invoices/{}/payments", invoice.id)), &owner, Some(service.id))
            .json(&json!({"amount": "4000"}))
            .await
            .json();
        assert_eq!(receipt.invoice.balance_due, Decimal::new(6000, 0));
        assert_eq!(receipt.invoice.status, InvoiceStatus::Pending);
        assert_eq!(receipt.payment.method, "Cash");
        assert_eq!(receipt.payment.cashier_id, Some(owner.id));

        // Overpayment is rejected
        authenticated(server.post(&format!("/invoices/{}/payments", invoice.id)), &owner, Some(service.id))
            .json(&json!({"amount": "7000"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let receipt: PaymentReceipt = authenticated(server.post(&format!("/invoices/{}/payments", invoice.id)), &owner, Some(service.id))
            .json(&json!({"amount": "6000", "method": "BankTransfer"}))
            .await
            .json();
        assert_eq!(receipt.invoice.status, InvoiceStatus::Paid);

        authenticated(server.post(&format!("/invoices/{}/payments", invoice.id)), &owner, Some(service.id))
            .json(&json!({"amount": "1"}))
            .await
            .assert_status(StatusCode::CONFLICT);

        let payments: Vec<PaymentResponse> = authenticated(server.get(&format!("/invoices/{}/payments", invoice.id)), &customer, Some(service.id))
            .await
            .json();
        assert_eq!(payments.len(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_customers_see_only_their_invoices(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Host").await;
        let alice = create_test_member(&pool, "alice").await;
        let bob = create_test_member(&pool, "bob").await;
        let alice_subscription = subscribe(&pool, service.id, alice.id).await;
        let bob_subscription = subscribe(&pool, service.id, bob.id).await;
        let server = server(pool).await;

        let mut invoices = vec![];
        for subscription_id in [alice_subscription, bob_subscription] {
            let invoice: InvoiceResponse = authenticated(server.post("/invoices"), &owner, Some(service.id))
                .json(&json!({"subscription_id": subscription_id, "due_date": "2030-01-31"}))
                .await
                .json();
            invoices.push(invoice);
        }

        let page: PaginatedResponse<InvoiceResponse> = authenticated(server.get("/invoices"), &alice, Some(service.id)).await.json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, invoices[0].id);

        authenticated(server.get(&format!("/invoices/{}", invoices[1].id)), &alice, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        authenticated(server.post(&format!("/invoices/{}/payments", invoices[0].id)), &alice, Some(service.id))
            .json(&json!({"amount": "5000"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_invoice_of_another_service_is_not_found(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let host = create_test_service(&pool, owner.id, "Host").await;
        let other = create_test_service(&pool, owner.id, "Other").await;
        let customer = create_test_member(&pool, "customer").await;
        let subscription_id = subscribe(&pool, host.id, customer.id).await;
        let server = server(pool).await;

        let invoice: InvoiceResponse = authenticated(server.post("/invoices"), &owner, Some(host.id))
            .json(&json!({"subscription_id": subscription_id, "due_date": "2030-01-31"}))
            .await
            .json();

        authenticated(server.get(&format!("/invoices/{}", invoice.id)), &owner, Some(other.id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        authenticated(server.post("/invoices"), &owner, Some(other.id))
            .json(&json!({"subscription_id": subscription_id, "due_date": "2030-01-31"}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
