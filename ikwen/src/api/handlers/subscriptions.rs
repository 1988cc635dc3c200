use crate::api::models::billing::{
    BillingCycleChange, ListSubscriptionsQuery, SubscriptionCreate, SubscriptionResponse, SubscriptionStatusChange,
};
use crate::api::models::members::CurrentUser;
use crate::api::models::pagination::PaginatedResponse;
use crate::auth::permissions::{RequiresPermission, can_read_all_resources, operation, resource};
use crate::billing::status::SubscriptionStatus;
use crate::db::errors::DbError;
use crate::db::handlers::{Groups, Members, ProfileTags, Products, Repository, Services, Subscriptions, subscriptions::SubscriptionFilter};
use crate::db::models::groups::COMMUNITY_GROUP;
use crate::db::models::subscriptions::{SubscriptionCreateDBRequest, SubscriptionDBResponse};
use crate::errors::{Error, Result};
use crate::types::{Operation, Permission, Resource, ServiceId, SubscriptionId, abbrev_uuid};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::{info, warn};

pub(crate) async fn tenant_subscription(
    conn: &mut PgConnection,
    service_id: ServiceId,
    subscription_id: SubscriptionId,
) -> Result<SubscriptionDBResponse> {
    Subscriptions::new(conn)
        .get_by_id(subscription_id)
        .await?
        .filter(|s| s.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: subscription_id.to_string(),
        })
}

#[utoipa::path(
    get,
    path = "/subscriptions",
    tag = "billing",
    summary = "List subscriptions",
    description = "Staff with read access see every subscription of the service, other members only their own.",
    params(ListSubscriptionsQuery),
    responses(
        (status = 200, description = "Subscriptions", body = PaginatedResponse<SubscriptionResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ListSubscriptionsQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<SubscriptionResponse>>> {
    let service_id = current_user.tenant()?;
    let member_id = if can_read_all_resources(&current_user, Resource::Subscriptions) {
        query.member_id
    } else {
        Some(current_user.id)
    };
    let list_query = query.to_list_query();
    let filter = SubscriptionFilter {
        service_id,
        member_id,
        status: query.status,
        query: list_query.clone(),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let subscriptions = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        subscriptions.into_iter().map(SubscriptionResponse::from).collect(),
        total_count,
        list_query.skip,
        list_query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/subscriptions",
    tag = "billing",
    summary = "Subscribe a member",
    description = "A member who is not part of the service yet joins its Community.",
    request_body = SubscriptionCreate,
    responses(
        (status = 201, description = "Subscription created", body = SubscriptionResponse),
        (status = 400, description = "Missing cost or invalid tolerance"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Member or product not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_subscription(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Subscriptions, operation::CreateAll>,
    Json(create): Json<SubscriptionCreate>,
) -> Result<(StatusCode, Json<SubscriptionResponse>)> {
    let service_id = current_user.tenant()?;
    let mut tx = state.db.begin().await.map_err(DbError::from)?;

    let member = Members::new(&mut tx)
        .get_by_id(create.member_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| Error::NotFound {
            resource: "Member".to_string(),
            id: create.member_id.to_string(),
        })?;

    let product = match create.product_id {
        Some(product_id) => Some(
            Products::new(&mut tx)
                .get_by_id(product_id)
                .await?
                .filter(|p| p.service_id == service_id)
                .ok_or_else(|| Error::NotFound {
                    resource: "Product".to_string(),
                    id: product_id.to_string(),
                })?,
        ),
        None => None,
    };
    let monthly_cost = create
        .monthly_cost
        .or(product.as_ref().map(|p| p.cost))
        .ok_or_else(|| Error::BadRequest {
            message: "monthly_cost is required for a subscription without product".to_string(),
        })?;
    if monthly_cost < Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "monthly_cost cannot be negative".to_string(),
        });
    }
    let invoice_tolerance = match create.invoice_tolerance {
        Some(tolerance) if tolerance < 0 => {
            return Err(Error::BadRequest {
                message: "invoice_tolerance cannot be negative".to_string(),
            });
        }
        Some(tolerance) => tolerance,
        None => Services::new(&mut tx).get_invoicing_config(service_id).await?.tolerance,
    };
    let details = match (create.details.trim(), &product) {
        ("", Some(product)) => product.name.clone(),
        (details, _) => details.to_string(),
    };

    let mut groups = Groups::new(&mut tx);
    if groups.member_groups(service_id, member.id).await?.is_empty() {
        groups.add_member_to_named(service_id, COMMUNITY_GROUP, member.id).await?;
        ProfileTags::new(&mut tx).refresh_member_counts(service_id).await?;
    }

    let subscription = Subscriptions::new(&mut tx)
        .create(&SubscriptionCreateDBRequest {
            service_id,
            member_id: member.id,
            product_id: product.map(|p| p.id),
            monthly_cost,
            billing_cycle: create.billing_cycle,
            details,
            expiry: create.expiry,
            invoice_tolerance,
            status: SubscriptionStatus::Active,
        })
        .await?;
    tx.commit().await.map_err(DbError::from)?;

    info!(subscription_id = %abbrev_uuid(&subscription.id), member_id = %abbrev_uuid(&member.id), "Subscription created");
    if let Err(e) = state.payer.announce_subscription(&subscription).await {
        warn!(error = %e, "Failed to announce subscription");
    }
    Ok((StatusCode::CREATED, Json(SubscriptionResponse::from(subscription))))
}

#[utoipa::path(
    get,
    path = "/subscriptions/{id}",
    tag = "billing",
    summary = "Get subscription",
    params(("id" = uuid::Uuid, Path, description = "Subscription ID")),
    responses(
        (status = 200, description = "Subscription", body = SubscriptionResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Subscription not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    current_user: CurrentUser,
) -> Result<Json<SubscriptionResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let subscription = tenant_subscription(&mut conn, service_id, id).await?;
    if subscription.member_id != current_user.id && !can_read_all_resources(&current_user, Resource::Subscriptions) {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Subscriptions, Operation::ReadAll),
            action: Operation::ReadAll,
            resource: format!("subscription {id}"),
        });
    }
    Ok(Json(SubscriptionResponse::from(subscription)))
}

#[utoipa::path(
    put,
    path = "/subscriptions/{id}/billing-cycle",
    tag = "billing",
    summary = "Change billing cycle",
    description = "The next invoice covers the new cycle. Invoices already issued are unchanged.",
    params(("id" = uuid::Uuid, Path, description = "Subscription ID")),
    request_body = BillingCycleChange,
    responses(
        (status = 200, description = "Billing cycle changed", body = SubscriptionResponse),
        (status = 400, description = "Subscription is canceled"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Subscription not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn change_billing_cycle(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    current_user: RequiresPermission<resource::Subscriptions, operation::UpdateAll>,
    Json(change): Json<BillingCycleChange>,
) -> Result<Json<SubscriptionResponse>> {
    let service_id = current_user.tenant()?;
    {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        tenant_subscription(&mut conn, service_id, id).await?;
    }
    let subscription = state.payer.change_billing_cycle(id, change.billing_cycle).await?;
    Ok(Json(SubscriptionResponse::from(subscription)))
}

#[utoipa::path(
    put,
    path = "/subscriptions/{id}/status",
    tag = "billing",
    summary = "Change subscription status",
    description = "Only transitions allowed from the current status are accepted.",
    params(("id" = uuid::Uuid, Path, description = "Subscription ID")),
    request_body = SubscriptionStatusChange,
    responses(
        (status = 200, description = "Status changed", body = SubscriptionResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Subscription not found"),
        (status = 409, description = "Transition not allowed"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn change_subscription_status(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    current_user: RequiresPermission<resource::Subscriptions, operation::UpdateAll>,
    Json(change): Json<SubscriptionStatusChange>,
) -> Result<Json<SubscriptionResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_subscription(&mut conn, service_id, id).await?;
    let subscription = Subscriptions::new(&mut conn).transition(id, change.status).await?;
    info!(subscription_id = %abbrev_uuid(&id), status = %subscription.status, "Subscription status changed");
    Ok(Json(SubscriptionResponse::from(subscription)))
}
