use crate::api::models::billing::{ListPaymentMeansQuery, PaymentMeanCreate, PaymentMeanCredentials, PaymentMeanResponse};
use crate::api::models::members::CurrentUser;
use crate::auth::permissions::{RequiresPermission, can_read_all_resources, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{PaymentMeans, services::slugify};
use crate::db::models::payments::{PaymentMeanCreateDBRequest, PaymentMeanDBResponse};
use crate::errors::{Error, Result};
use crate::mobile_money::{ProviderKind, validate_credentials};
use crate::types::{PaymentMeanId, Resource, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;
use tracing::info;

async fn tenant_payment_mean(conn: &mut PgConnection, service_id: ServiceId, id: PaymentMeanId) -> Result<PaymentMeanDBResponse> {
    PaymentMeans::new(conn)
        .get_by_id(id)
        .await?
        .filter(|m| m.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Payment mean".to_string(),
            id: id.to_string(),
        })
}

/// Operator means must carry credentials their provider can use
fn check_credentials(slug: &str, credentials: &serde_json::Value) -> Result<()> {
    if !credentials.is_object() {
        return Err(Error::BadRequest {
            message: "credentials must be a JSON object".to_string(),
        });
    }
    if let Ok(kind) = slug.parse::<ProviderKind>() {
        validate_credentials(kind, credentials).map_err(|e| Error::BadRequest { message: e.to_string() })?;
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/payment-means",
    tag = "billing",
    summary = "List payment means",
    description = "Members without read access to payment means only see active ones.",
    params(ListPaymentMeansQuery),
    responses(
        (status = 200, description = "Payment means of the current service", body = [PaymentMeanResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_payment_means(
    State(state): State<AppState>,
    Query(query): Query<ListPaymentMeansQuery>,
    current_user: CurrentUser,
) -> Result<Json<Vec<PaymentMeanResponse>>> {
    let service_id = current_user.tenant()?;
    let active_only = query.active_only || !can_read_all_resources(&current_user, Resource::PaymentMeans);
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let means = PaymentMeans::new(&mut conn).list(service_id, active_only).await?;
    Ok(Json(means.into_iter().map(PaymentMeanResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/payment-means",
    tag = "billing",
    summary = "Add payment mean",
    request_body = PaymentMeanCreate,
    responses(
        (status = 201, description = "Payment mean created", body = PaymentMeanResponse),
        (status = 400, description = "Invalid slug or credentials"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "The service already has a payment mean with this slug"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_payment_mean(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::PaymentMeans, operation::CreateAll>,
    Json(create): Json<PaymentMeanCreate>,
) -> Result<(StatusCode, Json<PaymentMeanResponse>)> {
    let service_id = current_user.tenant()?;
    let slug = slugify(&create.slug);
    if slug.is_empty() || create.name.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "Payment means need a name and a slug".to_string(),
        });
    }
    // Empty credentials are filled in later through the credentials endpoint
    if create.credentials.as_object().is_none_or(|o| !o.is_empty()) {
        check_credentials(&slug, &create.credentials)?;
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mean = PaymentMeans::new(&mut conn)
        .create(&PaymentMeanCreateDBRequest {
            service_id,
            name: create.name.trim().to_string(),
            slug,
            credentials: create.credentials,
            is_active: create.is_active,
        })
        .await?;
    info!(slug = %mean.slug, "Payment mean added");
    Ok((StatusCode::CREATED, Json(PaymentMeanResponse::from(mean))))
}

#[utoipa::path(
    post,
    path = "/payment-means/{id}/toggle",
    tag = "billing",
    summary = "Enable or disable a payment mean",
    params(("id" = uuid::Uuid, Path, description = "Payment mean ID")),
    responses(
        (status = 200, description = "Payment mean toggled", body = PaymentMeanResponse),
        (status = 400, description = "Credentials missing"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Payment mean not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn toggle_payment_mean(
    State(state): State<AppState>,
    Path(id): Path<PaymentMeanId>,
    current_user: RequiresPermission<resource::PaymentMeans, operation::UpdateAll>,
) -> Result<Json<PaymentMeanResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mean = tenant_payment_mean(&mut conn, service_id, id).await?;
    if !mean.is_active {
        check_credentials(&mean.slug, &mean.credentials.0)?;
    }
    let mean = PaymentMeans::new(&mut conn).toggle(id).await?;
    info!(slug = %mean.slug, is_active = mean.is_active, "Payment mean toggled");
    Ok(Json(PaymentMeanResponse::from(mean)))
}

#[utoipa::path(
    put,
    path = "/payment-means/{id}/credentials",
    tag = "billing",
    summary = "Set payment mean credentials",
    params(("id" = uuid::Uuid, Path, description = "Payment mean ID")),
    request_body = PaymentMeanCredentials,
    responses(
        (status = 200, description = "Credentials saved", body = PaymentMeanResponse),
        (status = 400, description = "Credentials incomplete"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Payment mean not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn set_payment_mean_credentials(
    State(state): State<AppState>,
    Path(id): Path<PaymentMeanId>,
    current_user: RequiresPermission<resource::PaymentMeans, operation::UpdateAll>,
    Json(body): Json<PaymentMeanCredentials>,
) -> Result<Json<PaymentMeanResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mean = tenant_payment_mean(&mut conn, service_id, id).await?;
    check_credentials(&mean.slug, &body.credentials)?;
    let mean = PaymentMeans::new(&mut conn).set_credentials(id, &body.credentials).await?;
    Ok(Json(PaymentMeanResponse::from(mean)))
}
