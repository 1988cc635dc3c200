use crate::api::models::pagination::PaginatedResponse;
use crate::api::models::revivals::{ListRevivalsQuery, RevivalCreate, RevivalResponse, RevivalUpdate};
use crate::auth::permissions::{RequiresPermission, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{Repository, Revivals, revivals::RevivalFilter};
use crate::db::models::revivals::{RevivalCreateDBRequest, RevivalDBResponse, RevivalUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{RevivalId, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;
use tracing::info;

async fn tenant_revival(conn: &mut PgConnection, service_id: ServiceId, id: RevivalId) -> Result<RevivalDBResponse> {
    Revivals::new(conn)
        .get_by_id(id)
        .await?
        .filter(|r| r.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Revival".to_string(),
            id: id.to_string(),
        })
}

fn require_text(field: &str, value: Option<&str>) -> Result<()> {
    if value.is_some_and(|v| v.trim().is_empty()) {
        return Err(Error::BadRequest {
            message: format!("{field} cannot be empty"),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/revivals",
    tag = "revivals",
    summary = "List smart revivals",
    params(ListRevivalsQuery),
    responses(
        (status = 200, description = "Smart revivals of the current service", body = PaginatedResponse<RevivalResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_revivals(
    State(state): State<AppState>,
    Query(query): Query<ListRevivalsQuery>,
    current_user: RequiresPermission<resource::Revivals, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<RevivalResponse>>> {
    let service_id = current_user.tenant()?;
    let list_query = query.to_list_query();
    let filter = RevivalFilter {
        service_id,
        status: query.status,
        query: list_query.clone(),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Revivals::new(&mut conn);
    let revivals = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        revivals.into_iter().map(RevivalResponse::from).collect(),
        total_count,
        list_query.skip,
        list_query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/revivals",
    tag = "revivals",
    summary = "Create smart revival",
    description = "The revival mails every member whose profile tags intersect the tags of the object. \
        It starts pending and is picked up by the next revival run.",
    request_body = RevivalCreate,
    responses(
        (status = 201, description = "Revival created", body = RevivalResponse),
        (status = 400, description = "Missing subject, content or model name"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_revival(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Revivals, operation::CreateAll>,
    Json(create): Json<RevivalCreate>,
) -> Result<(StatusCode, Json<RevivalResponse>)> {
    let service_id = current_user.tenant()?;
    require_text("model_name", Some(&create.model_name))?;
    require_text("mail_subject", Some(&create.mail_subject))?;
    require_text("mail_content", Some(&create.mail_content))?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let revival = Revivals::new(&mut conn)
        .create(&RevivalCreateDBRequest {
            service_id,
            model_name: create.model_name.trim().to_string(),
            object_id: create.object_id,
            mail_subject: create.mail_subject.trim().to_string(),
            mail_content: create.mail_content,
        })
        .await?;
    info!(revival_id = %revival.id, model = %revival.model_name, "Smart revival created");
    Ok((StatusCode::CREATED, Json(RevivalResponse::from(revival))))
}

#[utoipa::path(
    get,
    path = "/revivals/{id}",
    tag = "revivals",
    summary = "Get smart revival",
    params(("id" = uuid::Uuid, Path, description = "Revival ID")),
    responses(
        (status = 200, description = "Revival", body = RevivalResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Revival not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_revival(
    State(state): State<AppState>,
    Path(id): Path<RevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::ReadAll>,
) -> Result<Json<RevivalResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let revival = tenant_revival(&mut conn, service_id, id).await?;
    Ok(Json(RevivalResponse::from(revival)))
}

#[utoipa::path(
    patch,
    path = "/revivals/{id}",
    tag = "revivals",
    summary = "Update smart revival",
    description = "Edits the mail or pauses the revival. Progress and status only change through revival runs.",
    params(("id" = uuid::Uuid, Path, description = "Revival ID")),
    request_body = RevivalUpdate,
    responses(
        (status = 200, description = "Revival updated", body = RevivalResponse),
        (status = 400, description = "Empty subject or content"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Revival not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_revival(
    State(state): State<AppState>,
    Path(id): Path<RevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::UpdateAll>,
    Json(update): Json<RevivalUpdate>,
) -> Result<Json<RevivalResponse>> {
    let service_id = current_user.tenant()?;
    require_text("mail_subject", update.mail_subject.as_deref())?;
    require_text("mail_content", update.mail_content.as_deref())?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_revival(&mut conn, service_id, id).await?;
    let revival = Revivals::new(&mut conn)
        .update(
            id,
            &RevivalUpdateDBRequest {
                mail_subject: update.mail_subject.map(|s| s.trim().to_string()),
                mail_content: update.mail_content,
                is_active: update.is_active,
            },
        )
        .await?;
    Ok(Json(RevivalResponse::from(revival)))
}

#[utoipa::path(
    delete,
    path = "/revivals/{id}",
    tag = "revivals",
    summary = "Delete smart revival",
    params(("id" = uuid::Uuid, Path, description = "Revival ID")),
    responses(
        (status = 204, description = "Revival deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Revival not found"),
        (status = 409, description = "The revival is being sent"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_revival(
    State(state): State<AppState>,
    Path(id): Path<RevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::DeleteAll>,
) -> Result<StatusCode> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_revival(&mut conn, service_id, id).await?;
    if !Revivals::new(&mut conn).delete(id).await? {
        return Err(Error::Conflict {
            message: "The revival is being sent and cannot be deleted now".to_string(),
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::status::RevivalStatus;
    use crate::db::models::groups::COMMUNITY_GROUP;
    use crate::test_utils::{add_to_group, authenticated, create_test_member, create_test_service, create_test_state};
    use axum::routing::get;
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/revivals", get(list_revivals).post(create_revival))
            .route("/revivals/{id}", get(get_revival).patch(update_revival).delete(delete_revival))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_revival_crud(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Boutique").await;
        let server = server(pool.clone()).await;

        let created = authenticated(server.post("/revivals"), &owner, Some(service.id))
            .json(&json!({
                "model_name": "billing.Product",
                "object_id": Uuid::new_v4(),
                "mail_subject": "New arrivals",
                "mail_content": "<p>Hello $client</p>"
            }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let revival: RevivalResponse = created.json();
        assert_eq!(revival.status, RevivalStatus::Pending);
        assert_eq!(revival.progress, 0);

        authenticated(server.patch(&format!("/revivals/{}", revival.id)), &owner, Some(service.id))
            .json(&json!({"mail_subject": "  "}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        let paused: RevivalResponse = authenticated(server.patch(&format!("/revivals/{}", revival.id)), &owner, Some(service.id))
            .json(&json!({"is_active": false}))
            .await
            .json();
        assert!(!paused.is_active);
        assert_eq!(paused.mail_subject, "New arrivals");

        let page: PaginatedResponse<RevivalResponse> = authenticated(server.get("/revivals"), &owner, Some(service.id))
            .add_query_param("status", "started")
            .await
            .json();
        assert_eq!(page.total_count, 0);

        sqlx::query("UPDATE revivals SET is_running = TRUE WHERE id = $1")
            .bind(revival.id)
            .execute(&pool)
            .await
            .unwrap();
        authenticated(server.delete(&format!("/revivals/{}", revival.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::CONFLICT);

        sqlx::query("UPDATE revivals SET is_running = FALSE WHERE id = $1")
            .bind(revival.id)
            .execute(&pool)
            .await
            .unwrap();
        authenticated(server.delete(&format!("/revivals/{}", revival.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_revivals_are_staff_only_and_tenant_scoped(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Boutique").await;
        let other = create_test_service(&pool, owner.id, "Other shop").await;
        let customer = create_test_member(&pool, "customer").await;
        add_to_group(&pool, service.id, COMMUNITY_GROUP, customer.id).await;
        let server = server(pool).await;

        let revival: RevivalResponse = authenticated(server.post("/revivals"), &owner, Some(other.id))
            .json(&json!({
                "model_name": "billing.Product",
                "object_id": Uuid::new_v4(),
                "mail_subject": "Sale",
                "mail_content": "<p>Sale</p>"
            }))
            .await
            .json();

        authenticated(server.get(&format!("/revivals/{}", revival.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        authenticated(server.get("/revivals"), &customer, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }
}
