use crate::api::handlers::groups::tenant_group;
use crate::api::models::groups::{GroupResponse, PermissionSet};
use crate::api::models::members::{CurrentUser, ListMembersQuery, MemberResponse, MemberTagsRequest, MemberUpdate, MoveToGroupRequest};
use crate::api::models::pagination::PaginatedResponse;
use crate::api::models::revivals::ProfileTagResponse;
use crate::auth::permissions::{RequiresPermission, can_manage_member, operation, resource};
use crate::auth::utils::{compose_full_name, looks_like_email, normalize_phone};
use crate::db::errors::DbError;
use crate::db::handlers::{Groups, Members, ProfileTags, Repository, Services, members::MemberFilter};
use crate::db::models::groups::{COMMUNITY_GROUP, MemberPermissionGrant};
use crate::db::models::members::{MemberDBResponse, MemberUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{MemberId, Operation, Permission, Resource, ServiceId, abbrev_uuid};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use sqlx::PgConnection;
use tracing::info;

fn member_not_found(member_id: MemberId) -> Error {
    Error::NotFound {
        resource: "Member".to_string(),
        id: member_id.to_string(),
    }
}

/// A member of the current service's community
async fn tenant_member(conn: &mut PgConnection, service_id: ServiceId, member_id: MemberId) -> Result<MemberDBResponse> {
    if Groups::new(&mut *conn).member_groups(service_id, member_id).await?.is_empty() {
        return Err(member_not_found(member_id));
    }
    Members::new(conn).get_by_id(member_id).await?.ok_or_else(|| member_not_found(member_id))
}

fn require_member_access(user: &CurrentUser, member_id: MemberId, operation: Operation) -> Result<()> {
    if can_manage_member(user, member_id, operation) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Members, operation),
            action: operation,
            resource: format!("member {member_id}"),
        })
    }
}

/// The owner's membership and status are managed through the service itself
async fn reject_owner(conn: &mut PgConnection, service_id: ServiceId, member_id: MemberId, action: &str) -> Result<()> {
    let service = Services::new(conn).get_by_id(service_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Service".to_string(),
        id: service_id.to_string(),
    })?;
    if service.member_id == member_id {
        return Err(Error::BadRequest {
            message: format!("The service owner cannot be {action}"),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/members/me",
    tag = "members",
    summary = "Get the current member",
    responses(
        (status = 200, description = "Current member", body = MemberResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_current_member(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<MemberResponse>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let member = Members::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .ok_or(Error::Unauthenticated { message: None })?;
    Ok(Json(MemberResponse::from(member)))
}

/// Update the current member's personal information
#[utoipa::path(
    patch,
    path = "/members/me",
    tag = "members",
    summary = "Update the current member",
    request_body = MemberUpdate,
    responses(
        (status = 200, description = "Member updated", body = MemberResponse),
        (status = 400, description = "Invalid email or phone"),
        (status = 409, description = "Email or phone already used by another account"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(member_id = %abbrev_uuid(&current_user.id)))]
pub async fn update_current_member(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(update): Json<MemberUpdate>,
) -> Result<Json<MemberResponse>> {
    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    let mut members = Members::new(&mut tx);
    let member = members
        .get_by_id(current_user.id)
        .await?
        .ok_or(Error::Unauthenticated { message: None })?;

    let email = update.email.as_deref().map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());
    if let Some(email) = &email {
        if !looks_like_email(email) {
            return Err(Error::BadRequest {
                message: format!("'{email}' is not a valid email address"),
            });
        }
        if let Some(other) = members.get_by_email(email).await?
            && other.id != member.id
        {
            return Err(Error::Conflict {
                message: "This email is already used by another account".to_string(),
            });
        }
    }

    let phone = update.phone.as_deref().map(normalize_phone).filter(|p| !p.is_empty());
    if let Some(phone) = &phone
        && let Some(other) = members.get_by_phone(phone).await?
        && other.id != member.id
        && !other.is_ghost
    {
        return Err(Error::Conflict {
            message: "This phone is already used by another account".to_string(),
        });
    }

    let first_name = update.first_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let last_name = update.last_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let full_name = (first_name.is_some() || last_name.is_some()).then(|| {
        compose_full_name(first_name.unwrap_or(&member.first_name), last_name.unwrap_or(&member.last_name))
    });

    let updated = members
        .update(
            member.id,
            &MemberUpdateDBRequest {
                email,
                phone,
                first_name: first_name.map(str::to_string),
                last_name: last_name.map(str::to_string),
                full_name,
                gender: update.gender,
                language: update.language,
                ..Default::default()
            },
        )
        .await?;
    tx.commit().await.map_err(DbError::from)?;

    Ok(Json(MemberResponse::from(updated)))
}

#[utoipa::path(
    get,
    path = "/members",
    tag = "members",
    summary = "List the community",
    params(ListMembersQuery),
    responses(
        (status = 200, description = "Members of the current service", body = PaginatedResponse<MemberResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_members(
    State(state): State<AppState>,
    Query(params): Query<ListMembersQuery>,
    current_user: RequiresPermission<resource::Members, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<MemberResponse>>> {
    let service_id = current_user.tenant()?;
    let query = params.to_list_query();
    let filter = MemberFilter::community(service_id, query.clone());

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut members = Members::new(&mut conn);
    let page = members.list(&filter).await?;
    let total_count = members.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        page.into_iter().map(MemberResponse::from).collect(),
        total_count,
        query.skip,
        query.limit,
    )))
}

#[utoipa::path(
    get,
    path = "/members/{member_id}",
    tag = "members",
    summary = "Get member",
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Member details", body = MemberResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not a member of the current service"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_member(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: CurrentUser,
) -> Result<Json<MemberResponse>> {
    require_member_access(&current_user, member_id, Operation::ReadAll)?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;

    let member = if member_id == current_user.id {
        Members::new(&mut conn).get_by_id(member_id).await?.ok_or_else(|| member_not_found(member_id))?
    } else {
        tenant_member(&mut conn, current_user.tenant()?, member_id).await?
    };
    Ok(Json(MemberResponse::from(member)))
}

/// Activate or deactivate a member. A deactivated member loses their session.
#[utoipa::path(
    post,
    path = "/members/{member_id}/toggle",
    tag = "members",
    summary = "Toggle member",
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Member with its new status", body = MemberResponse),
        (status = 400, description = "The owner or the current member cannot be toggled"),
        (status = 404, description = "Not a member of the current service"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(member_id = %abbrev_uuid(&member_id)))]
pub async fn toggle_member(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: RequiresPermission<resource::Members, operation::UpdateAll>,
) -> Result<Json<MemberResponse>> {
    let service_id = current_user.tenant()?;
    if member_id == current_user.id {
        return Err(Error::BadRequest {
            message: "You cannot deactivate your own account".to_string(),
        });
    }
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    reject_owner(&mut conn, service_id, member_id, "deactivated").await?;
    let member = tenant_member(&mut conn, service_id, member_id).await?;

    let updated = Members::new(&mut conn)
        .update(
            member.id,
            &MemberUpdateDBRequest {
                is_active: Some(!member.is_active),
                ..Default::default()
            },
        )
        .await?;
    info!(is_active = updated.is_active, "Member toggled");
    Ok(Json(MemberResponse::from(updated)))
}

/// Move a member to one group of the service.
///
/// The member leaves every other group of the service. Joining any group other than
/// `Community` makes them staff. Moving back to `Community` revokes staff status.
#[utoipa::path(
    put,
    path = "/members/{member_id}/group",
    tag = "members",
    summary = "Move member to group",
    request_body = MoveToGroupRequest,
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "The member's new group", body = GroupResponse),
        (status = 400, description = "The service owner cannot be moved"),
        (status = 404, description = "Member or group not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(member_id = %abbrev_uuid(&member_id)))]
pub async fn move_member_to_group(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: RequiresPermission<resource::Members, operation::UpdateAll>,
    Json(request): Json<MoveToGroupRequest>,
) -> Result<Json<GroupResponse>> {
    let service_id = current_user.tenant()?;
    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    reject_owner(&mut tx, service_id, member_id, "moved").await?;
    let member = tenant_member(&mut tx, service_id, member_id).await?;
    let group = tenant_group(&mut tx, service_id, request.group_id).await?;

    Groups::new(&mut tx).move_member(group.id, member.id).await?;
    let is_staff = group.name != COMMUNITY_GROUP;
    if member.is_staff != is_staff {
        Members::new(&mut tx)
            .update(
                member.id,
                &MemberUpdateDBRequest {
                    is_staff: Some(is_staff),
                    ..Default::default()
                },
            )
            .await?;
    }
    tx.commit().await.map_err(DbError::from)?;

    info!(group = %group.name, "Member moved");
    Ok(Json(GroupResponse::from(group)))
}

#[utoipa::path(
    get,
    path = "/members/{member_id}/permissions",
    tag = "members",
    summary = "Get collaborator permissions",
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Permissions granted directly to the member", body = PermissionSet),
        (status = 404, description = "Not a member of the current service"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_member_permissions(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: RequiresPermission<resource::Members, operation::ReadAll>,
) -> Result<Json<PermissionSet>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_member(&mut conn, service_id, member_id).await?;

    let permissions = Groups::new(&mut conn).get_member_permissions(service_id, member_id).await?;
    Ok(Json(PermissionSet::from(permissions)))
}

/// Replace a staff member's collaborator permissions
#[utoipa::path(
    put,
    path = "/members/{member_id}/permissions",
    tag = "members",
    summary = "Set collaborator permissions",
    request_body = PermissionSet,
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Permissions replaced", body = PermissionSet),
        (status = 400, description = "The member is not staff"),
        (status = 404, description = "Not a member of the current service"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(member_id = %abbrev_uuid(&member_id)))]
pub async fn set_member_permissions(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: RequiresPermission<resource::Members, operation::UpdateAll>,
    Json(set): Json<PermissionSet>,
) -> Result<Json<PermissionSet>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let member = tenant_member(&mut conn, service_id, member_id).await?;
    if !member.is_staff {
        return Err(Error::BadRequest {
            message: "Collaborator permissions can only be granted to staff".to_string(),
        });
    }

    let mut groups = Groups::new(&mut conn);
    groups
        .set_member_permissions(&MemberPermissionGrant {
            member_id,
            service_id,
            permissions: set.pairs(),
        })
        .await?;
    Ok(Json(PermissionSet::from(groups.get_member_permissions(service_id, member_id).await?)))
}

#[utoipa::path(
    get,
    path = "/members/{member_id}/profile-tags",
    tag = "members",
    summary = "Get member interests",
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Profile tags of the member", body = Vec<ProfileTagResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_member_profile_tags(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: CurrentUser,
) -> Result<Json<Vec<ProfileTagResponse>>> {
    require_member_access(&current_user, member_id, Operation::ReadAll)?;
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;

    let tags = ProfileTags::new(&mut conn).member_tags(service_id, member_id).await?;
    Ok(Json(tags.into_iter().map(ProfileTagResponse::from).collect()))
}

/// Replace a member's interests. Members can set their own.
#[utoipa::path(
    put,
    path = "/members/{member_id}/profile-tags",
    tag = "members",
    summary = "Set member interests",
    request_body = MemberTagsRequest,
    params(("member_id" = uuid::Uuid, Path, description = "Member ID")),
    responses(
        (status = 200, description = "Profile tags of the member", body = Vec<ProfileTagResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all, fields(member_id = %abbrev_uuid(&member_id)))]
pub async fn set_member_profile_tags(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
    current_user: CurrentUser,
    Json(request): Json<MemberTagsRequest>,
) -> Result<Json<Vec<ProfileTagResponse>>> {
    require_member_access(&current_user, member_id, Operation::UpdateAll)?;
    let service_id = current_user.tenant()?;
    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    if member_id != current_user.id {
        tenant_member(&mut tx, service_id, member_id).await?;
    }

    let mut tags = ProfileTags::new(&mut tx);
    tags.set_member_tags(service_id, member_id, &request.tag_ids).await?;
    let current = tags.member_tags(service_id, member_id).await?;
    tx.commit().await.map_err(DbError::from)?;

    Ok(Json(current.into_iter().map(ProfileTagResponse::from).collect()))
}
