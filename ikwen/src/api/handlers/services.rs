//! HTTP handlers for services (tenants). Creating, editing and deleting services is reserved to
//! the platform superuser. Any member can join a service's community.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::{
        members::CurrentUser,
        pagination::PaginatedResponse,
        services::{ListServicesQuery, ServiceCreate, ServiceResponse, ServiceUpdate},
    },
    auth::permissions::RequiresSuperuser,
    db::{
        errors::DbError,
        handlers::{Groups, Members, ProfileTags, Repository, Services, services::{ServiceFilter, slugify}},
        models::{
            groups::COMMUNITY_GROUP,
            services::{ServiceCreateDBRequest, ServiceStatus, ServiceUpdateDBRequest},
        },
        router::DEFAULT_DB,
    },
    errors::{Error, Result},
    types::{ServiceId, abbrev_uuid},
};

fn service_not_found(service_id: ServiceId) -> Error {
    Error::NotFound {
        resource: "Service".to_string(),
        id: service_id.to_string(),
    }
}

#[utoipa::path(
    get,
    path = "/services",
    tag = "services",
    summary = "List services",
    params(ListServicesQuery),
    responses(
        (status = 200, description = "Services", body = PaginatedResponse<ServiceResponse>),
        (status = 403, description = "Superuser only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_services(
    State(state): State<AppState>,
    Query(params): Query<ListServicesQuery>,
    _: RequiresSuperuser,
) -> Result<Json<PaginatedResponse<ServiceResponse>>> {
    let query = params.to_list_query();
    let filter = ServiceFilter {
        member_id: params.owner_id,
        status: params.status,
        query: query.clone(),
    };
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut services = Services::new(&mut conn);
    let page = services.list(&filter).await?;
    let total_count = services.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        page.into_iter().map(ServiceResponse::from).collect(),
        total_count,
        query.skip,
        query.limit,
    )))
}

/// Create a service with its settings and reserved groups. The owner becomes its IAO.
#[utoipa::path(
    post,
    path = "/services",
    tag = "services",
    summary = "Create service",
    request_body = ServiceCreate,
    responses(
        (status = 201, description = "Service created", body = ServiceResponse),
        (status = 400, description = "Invalid project name, owner or database"),
        (status = 403, description = "Superuser only"),
        (status = 409, description = "A service with this project name exists"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_service(
    State(state): State<AppState>,
    _: RequiresSuperuser,
    Json(create): Json<ServiceCreate>,
) -> Result<(StatusCode, Json<ServiceResponse>)> {
    let project_name = create.project_name.trim().to_string();
    let slug = slugify(&project_name);
    if slug.is_empty() {
        return Err(Error::BadRequest {
            message: "Project name must contain letters or digits".to_string(),
        });
    }
    let database = create.database.as_deref().map(str::trim).filter(|d| !d.is_empty()).unwrap_or(DEFAULT_DB).to_string();
    if !state.db.contains(&database) {
        state.db.add_database(&database)?;
    }
    let domain = create.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()).map(str::to_lowercase).unwrap_or_else(|| format!("{slug}.ikwen.com"));

    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    let owner = Members::new(&mut tx)
        .get_by_id(create.owner_id)
        .await?
        .filter(|m| m.is_active && !m.is_ghost)
        .ok_or_else(|| Error::BadRequest {
            message: format!("Member {} cannot own a service", create.owner_id),
        })?;

    let service = Services::new(&mut tx)
        .create(&ServiceCreateDBRequest {
            member_id: owner.id,
            company_name: create.company_name.unwrap_or_else(|| project_name.clone()),
            contact_email: create.contact_email.or_else(|| owner.deliverable_email().map(str::to_string)),
            project_name,
            project_name_slug: slug,
            database,
            url: format!("https://{domain}"),
            domain,
            api_signature: Uuid::new_v4().simple().to_string(),
            billing_cycle: create.billing_cycle,
            version: create.version,
            status: ServiceStatus::Active,
            monthly_cost: create.monthly_cost,
            expiry: create.expiry,
        })
        .await?;
    tx.commit().await.map_err(DbError::from)?;

    info!(service_id = %abbrev_uuid(&service.id), slug = %service.project_name_slug, "Service created");
    Ok((StatusCode::CREATED, Json(ServiceResponse::from(service))))
}

#[utoipa::path(
    get,
    path = "/services/{service_id}",
    tag = "services",
    summary = "Get service",
    params(("service_id" = uuid::Uuid, Path, description = "Service ID")),
    responses(
        (status = 200, description = "Service details", body = ServiceResponse),
        (status = 404, description = "Service not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_service(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
    _: RequiresSuperuser,
) -> Result<Json<ServiceResponse>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let service = Services::new(&mut conn)
        .get_by_id(service_id)
        .await?
        .ok_or_else(|| service_not_found(service_id))?;
    Ok(Json(ServiceResponse::from(service)))
}

#[utoipa::path(
    patch,
    path = "/services/{service_id}",
    tag = "services",
    summary = "Update service",
    request_body = ServiceUpdate,
    params(("service_id" = uuid::Uuid, Path, description = "Service ID")),
    responses(
        (status = 200, description = "Service updated", body = ServiceResponse),
        (status = 404, description = "Service not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_service(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
    _: RequiresSuperuser,
    Json(update): Json<ServiceUpdate>,
) -> Result<Json<ServiceResponse>> {
    let domain = update.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()).map(str::to_lowercase);
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let service = Services::new(&mut conn)
        .update(
            service_id,
            &ServiceUpdateDBRequest {
                project_name: update.project_name.map(|n| n.trim().to_string()),
                url: domain.as_ref().map(|d| format!("https://{d}")),
                domain,
                billing_cycle: update.billing_cycle,
                version: update.version,
                status: update.status,
                monthly_cost: update.monthly_cost,
                expiry: update.expiry,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => service_not_found(service_id),
            other => other.into(),
        })?;
    Ok(Json(ServiceResponse::from(service)))
}

#[utoipa::path(
    delete,
    path = "/services/{service_id}",
    tag = "services",
    summary = "Delete service",
    params(("service_id" = uuid::Uuid, Path, description = "Service ID")),
    responses(
        (status = 204, description = "Service deleted"),
        (status = 404, description = "Service not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(service_id = %abbrev_uuid(&service_id)))]
pub async fn delete_service(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
    _: RequiresSuperuser,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    if !Services::new(&mut conn).delete(service_id).await? {
        return Err(service_not_found(service_id));
    }
    info!("Service deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Join a service's community. Joining twice is a no-op.
#[utoipa::path(
    post,
    path = "/services/{service_id}/join",
    tag = "services",
    summary = "Join service",
    params(("service_id" = uuid::Uuid, Path, description = "Service ID")),
    responses(
        (status = 200, description = "The current member belongs to the service", body = ServiceResponse),
        (status = 404, description = "Service not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(service_id = %abbrev_uuid(&service_id)))]
pub async fn join_service(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
    current_user: CurrentUser,
) -> Result<Json<ServiceResponse>> {
    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    let service = Services::new(&mut tx)
        .get_by_id(service_id)
        .await?
        .filter(|s| s.status == ServiceStatus::Active)
        .ok_or_else(|| service_not_found(service_id))?;

    let mut groups = Groups::new(&mut tx);
    if groups.member_groups(service_id, current_user.id).await?.is_empty() {
        groups.add_member_to_named(service_id, COMMUNITY_GROUP, current_user.id).await?;
        ProfileTags::new(&mut tx).refresh_member_counts(service_id).await?;
        info!(member_id = %abbrev_uuid(&current_user.id), "Member joined service");
    }
    tx.commit().await.map_err(DbError::from)?;

    Ok(Json(ServiceResponse::from(service)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::members::MemberDBResponse;
    use crate::test_utils::{authenticated, create_test_member, create_test_service, create_test_state};
    use axum::routing::{get, post};
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/services", get(list_services).post(create_service))
            .route("/services/{service_id}", get(get_service).patch(update_service).delete(delete_service))
            .route("/services/{service_id}/join", post(join_service))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    async fn superuser(pool: &PgPool) -> MemberDBResponse {
        let admin = create_test_member(pool, "root").await;
        sqlx::query("UPDATE members SET is_superuser = TRUE WHERE id = $1")
            .bind(admin.id)
            .execute(pool)
            .await
            .unwrap();
        admin
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_superuser_creates_service(pool: PgPool) {
        let admin = superuser(&pool).await;
        let owner = create_test_member(&pool, "mado").await;
        let server = server(pool.clone()).await;

        let response = authenticated(server.post("/services"), &admin, None)
            .json(&json!({"owner_id": owner.id, "project_name": "Boutique Mado", "monthly_cost": "2500"}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let service: ServiceResponse = response.json();
        assert_eq!(service.project_name_slug, "boutique-mado");
        assert_eq!(service.domain, "boutique-mado.ikwen.com");
        assert_eq!(service.owner_id, owner.id);

        let mut conn = pool.acquire().await.unwrap();
        let owner = Members::new(&mut conn).get_by_id(owner.id).await.unwrap().unwrap();
        assert!(owner.is_iao);
        let config = Services::new(&mut conn).get_config(service.id).await.unwrap();
        assert_eq!(config.company_name, "Boutique Mado");

        // Same slug again
        authenticated(server.post("/services"), &admin, None)
            .json(&json!({"owner_id": owner.id, "project_name": "boutique MADO"}))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_service_admin_is_superuser_only(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        authenticated(server.get("/services"), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        authenticated(server.delete(&format!("/services/{}", service.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_and_delete_service(pool: PgPool) {
        let admin = superuser(&pool).await;
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        let updated: ServiceResponse = authenticated(server.patch(&format!("/services/{}", service.id)), &admin, None)
            .json(&json!({"status": "suspended", "domain": "shop.cm"}))
            .await
            .json();
        assert_eq!(updated.status, ServiceStatus::Suspended);
        assert_eq!(updated.url, "https://shop.cm");

        authenticated(server.delete(&format!("/services/{}", service.id)), &admin, None)
            .await
            .assert_status(StatusCode::NO_CONTENT);
        authenticated(server.get(&format!("/services/{}", service.id)), &admin, None)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_join_is_idempotent(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let visitor = create_test_member(&pool, "visitor").await;
        let server = server(pool.clone()).await;

        for _ in 0..2 {
            authenticated(server.post(&format!("/services/{}/join", service.id)), &visitor, None)
                .await
                .assert_status_ok();
        }

        let mut conn = pool.acquire().await.unwrap();
        let groups = Groups::new(&mut conn).member_groups(service.id, visitor.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, COMMUNITY_GROUP);

        // The owner stays in Sudo
        authenticated(server.post(&format!("/services/{}/join", service.id)), &owner, None)
            .await
            .assert_status_ok();
        let groups = Groups::new(&mut conn).member_groups(service.id, owner.id).await.unwrap();
        assert_eq!(groups.len(), 1);
    }
}
