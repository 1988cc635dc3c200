use crate::api::models::groups::{GroupCreate, GroupResponse, GroupUpdate, PermissionSet};
use crate::api::models::pagination::{ListParams, PaginatedResponse};
use crate::auth::permissions::{RequiresPermission, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{Groups, Repository, groups::GroupFilter};
use crate::db::models::groups::{GroupCreateDBRequest, GroupDBResponse, GroupUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{GroupId, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;

/// A group of the current service. Groups of other services are reported as missing.
pub(crate) async fn tenant_group(conn: &mut PgConnection, service_id: ServiceId, group_id: GroupId) -> Result<GroupDBResponse> {
    Groups::new(conn)
        .get_by_id(group_id)
        .await?
        .filter(|g| g.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Group".to_string(),
            id: group_id.to_string(),
        })
}

#[utoipa::path(
    get,
    path = "/groups",
    tag = "groups",
    summary = "List groups",
    params(ListParams),
    responses(
        (status = 200, description = "Groups of the current service", body = PaginatedResponse<GroupResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_groups(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    current_user: RequiresPermission<resource::Groups, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<GroupResponse>>> {
    let service_id = current_user.tenant()?;
    let query = params.to_list_query();
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Groups::new(&mut conn);

    let groups = repo
        .list(&GroupFilter {
            service_id,
            query: query.clone(),
        })
        .await?;
    let total_count = repo.count(service_id, &query).await?;

    Ok(Json(PaginatedResponse::new(
        groups.into_iter().map(GroupResponse::from).collect(),
        total_count,
        query.skip,
        query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/groups",
    tag = "groups",
    summary = "Create group",
    request_body = GroupCreate,
    responses(
        (status = 201, description = "Group created", body = GroupResponse),
        (status = 400, description = "Invalid name"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "A group with this name already exists"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_group(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Groups, operation::CreateAll>,
    Json(create): Json<GroupCreate>,
) -> Result<(StatusCode, Json<GroupResponse>)> {
    let service_id = current_user.tenant()?;
    let name = create.name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest {
            message: "Group name is required".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let group = Groups::new(&mut conn)
        .create(&GroupCreateDBRequest {
            service_id,
            name: name.to_string(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(GroupResponse::from(group))))
}

#[utoipa::path(
    get,
    path = "/groups/{group_id}",
    tag = "groups",
    summary = "Get group",
    params(("group_id" = uuid::Uuid, Path, description = "Group ID")),
    responses(
        (status = 200, description = "Group details", body = GroupResponse),
        (status = 404, description = "Group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    current_user: RequiresPermission<resource::Groups, operation::ReadAll>,
) -> Result<Json<GroupResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let group = tenant_group(&mut conn, service_id, group_id).await?;
    Ok(Json(GroupResponse::from(group)))
}

#[utoipa::path(
    patch,
    path = "/groups/{group_id}",
    tag = "groups",
    summary = "Rename group",
    request_body = GroupUpdate,
    params(("group_id" = uuid::Uuid, Path, description = "Group ID")),
    responses(
        (status = 200, description = "Group updated", body = GroupResponse),
        (status = 403, description = "Reserved groups cannot be renamed"),
        (status = 404, description = "Group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    current_user: RequiresPermission<resource::Groups, operation::UpdateAll>,
    Json(update): Json<GroupUpdate>,
) -> Result<Json<GroupResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_group(&mut conn, service_id, group_id).await?;

    let group = Groups::new(&mut conn)
        .update(group_id, &GroupUpdateDBRequest { name: update.name })
        .await?;
    Ok(Json(GroupResponse::from(group)))
}

#[utoipa::path(
    delete,
    path = "/groups/{group_id}",
    tag = "groups",
    summary = "Delete group",
    params(("group_id" = uuid::Uuid, Path, description = "Group ID")),
    responses(
        (status = 204, description = "Group deleted"),
        (status = 403, description = "Reserved groups cannot be deleted"),
        (status = 404, description = "Group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    current_user: RequiresPermission<resource::Groups, operation::DeleteAll>,
) -> Result<StatusCode> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_group(&mut conn, service_id, group_id).await?;

    Groups::new(&mut conn).delete(group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/groups/{group_id}/permissions",
    tag = "groups",
    summary = "Get group permissions",
    params(("group_id" = uuid::Uuid, Path, description = "Group ID")),
    responses(
        (status = 200, description = "Permissions granted to the group's members", body = PermissionSet),
        (status = 404, description = "Group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_group_permissions(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    current_user: RequiresPermission<resource::Groups, operation::ReadAll>,
) -> Result<Json<PermissionSet>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_group(&mut conn, service_id, group_id).await?;

    let permissions = Groups::new(&mut conn).get_permissions(group_id).await?;
    Ok(Json(PermissionSet::from(permissions)))
}

#[utoipa::path(
    put,
    path = "/groups/{group_id}/permissions",
    tag = "groups",
    summary = "Replace group permissions",
    request_body = PermissionSet,
    params(("group_id" = uuid::Uuid, Path, description = "Group ID")),
    responses(
        (status = 200, description = "Permissions replaced", body = PermissionSet),
        (status = 404, description = "Group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn set_group_permissions(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    current_user: RequiresPermission<resource::Groups, operation::UpdateAll>,
    Json(set): Json<PermissionSet>,
) -> Result<Json<PermissionSet>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_group(&mut conn, service_id, group_id).await?;

    let mut repo = Groups::new(&mut conn);
    repo.set_permissions(group_id, &set.pairs()).await?;
    Ok(Json(PermissionSet::from(repo.get_permissions(group_id).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::groups::PermissionGrant;
    use crate::db::models::groups::{COMMUNITY_GROUP, SUDO_GROUP};
    use crate::test_utils::{add_to_group, authenticated, create_test_member, create_test_service, create_test_state};
    use crate::types::{Operation, Resource};
    use axum::routing::get;
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/groups", get(list_groups).post(create_group))
            .route("/groups/{group_id}", get(get_group).patch(update_group).delete(delete_group))
            .route("/groups/{group_id}/permissions", get(get_group_permissions).put(set_group_permissions))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_owner_manages_groups(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        let response = authenticated(server.post("/groups"), &owner, Some(service.id))
            .json(&json!({"name": "Cashiers"}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let group: GroupResponse = response.json();
        assert!(!group.reserved);

        let list: PaginatedResponse<GroupResponse> = authenticated(server.get("/groups"), &owner, Some(service.id)).await.json();
        assert_eq!(list.total_count, 3);

        let renamed: GroupResponse = authenticated(server.patch(&format!("/groups/{}", group.id)), &owner, Some(service.id))
            .json(&json!({"name": "Tellers"}))
            .await
            .json();
        assert_eq!(renamed.name, "Tellers");

        authenticated(server.delete(&format!("/groups/{}", group.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reserved_groups_are_protected(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let sudo = {
            let mut conn = pool.acquire().await.unwrap();
            Groups::new(&mut conn).get_by_name(service.id, SUDO_GROUP).await.unwrap().unwrap()
        };
        let server = server(pool).await;

        authenticated(server.delete(&format!("/groups/{}", sudo.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        authenticated(server.patch(&format!("/groups/{}", sudo.id)), &owner, Some(service.id))
            .json(&json!({"name": "Admins"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        authenticated(server.post("/groups"), &owner, Some(service.id))
            .json(&json!({"name": COMMUNITY_GROUP}))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_group_permissions_round_trip(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        let group: GroupResponse = authenticated(server.post("/groups"), &owner, Some(service.id))
            .json(&json!({"name": "Cashiers"}))
            .await
            .json();
        let set = PermissionSet {
            permissions: vec![
                PermissionGrant {
                    resource: Resource::Invoices,
                    operation: Operation::ReadAll,
                },
                PermissionGrant {
                    resource: Resource::Payments,
                    operation: Operation::CreateAll,
                },
            ],
        };
        let saved: PermissionSet = authenticated(server.put(&format!("/groups/{}/permissions", group.id)), &owner, Some(service.id))
            .json(&set)
            .await
            .json();
        assert_eq!(saved.permissions.len(), 2);
        assert!(saved.permissions.contains(&PermissionGrant {
            resource: Resource::Payments,
            operation: Operation::CreateAll,
        }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_community_member_cannot_manage_groups(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let customer = create_test_member(&pool, "customer").await;
        add_to_group(&pool, service.id, COMMUNITY_GROUP, customer.id).await;
        let other_owner = create_test_member(&pool, "rival").await;
        let other = create_test_service(&pool, other_owner.id, "Other").await;
        let server = server(pool.clone()).await;

        authenticated(server.get("/groups"), &customer, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        // Groups of another tenant are not visible through this one
        let foreign = {
            let mut conn = pool.acquire().await.unwrap();
            Groups::new(&mut conn).get_by_name(other.id, SUDO_GROUP).await.unwrap().unwrap()
        };
        authenticated(server.get(&format!("/groups/{}", foreign.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
