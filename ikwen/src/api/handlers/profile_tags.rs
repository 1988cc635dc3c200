use crate::api::models::members::CurrentUser;
use crate::api::models::pagination::PaginatedResponse;
use crate::api::models::revivals::{ListProfileTagsQuery, ObjectTagsRequest, ProfileTagCreate, ProfileTagResponse, ProfileTagUpdate};
use crate::auth::permissions::{RequiresPermission, can_read_all_resources, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{ProfileTags, Repository, profile_tags::ProfileTagFilter, services::slugify};
use crate::db::models::revivals::{ProfileTagCreateDBRequest, ProfileTagDBResponse, ProfileTagUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{ProfileTagId, Resource, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;
use tracing::info;

pub(crate) async fn tenant_profile_tag(conn: &mut PgConnection, service_id: ServiceId, id: ProfileTagId) -> Result<ProfileTagDBResponse> {
    ProfileTags::new(conn)
        .get_by_id(id)
        .await?
        .filter(|t| t.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Profile tag".to_string(),
            id: id.to_string(),
        })
}

#[utoipa::path(
    get,
    path = "/profile-tags",
    tag = "revivals",
    summary = "List profile tags",
    description = "Any member can list the tags of the current service to declare interests. \
        Tags created from browsing are only listed on request, to members who can read all tags.",
    params(ListProfileTagsQuery),
    responses(
        (status = 200, description = "Profile tags", body = PaginatedResponse<ProfileTagResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_profile_tags(
    State(state): State<AppState>,
    Query(query): Query<ListProfileTagsQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<ProfileTagResponse>>> {
    let service_id = current_user.tenant()?;
    let list_query = query.to_list_query();
    let filter = ProfileTagFilter {
        service_id,
        exclude_auto: !(query.include_auto && can_read_all_resources(&current_user, Resource::ProfileTags)),
        query: list_query.clone(),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = ProfileTags::new(&mut conn);
    let tags = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        tags.into_iter().map(ProfileTagResponse::from).collect(),
        total_count,
        list_query.skip,
        list_query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/profile-tags",
    tag = "revivals",
    summary = "Create profile tag",
    request_body = ProfileTagCreate,
    responses(
        (status = 201, description = "Profile tag created", body = ProfileTagResponse),
        (status = 400, description = "Empty name"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "A tag with the same slug exists"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_profile_tag(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::ProfileTags, operation::CreateAll>,
    Json(create): Json<ProfileTagCreate>,
) -> Result<(StatusCode, Json<ProfileTagResponse>)> {
    let service_id = current_user.tenant()?;
    let name = create.name.trim();
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(Error::BadRequest {
            message: "Profile tag name cannot be empty".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = ProfileTags::new(&mut conn);
    if repo.get_by_slug(service_id, &slug).await?.is_some() {
        return Err(Error::Conflict {
            message: format!("Profile tag '{slug}' already exists"),
        });
    }
    let tag = repo
        .create(&ProfileTagCreateDBRequest {
            service_id,
            name: name.to_string(),
            slug,
            is_reserved: create.is_reserved,
            is_auto: false,
        })
        .await?;
    info!(slug = %tag.slug, "Profile tag created");
    Ok((StatusCode::CREATED, Json(ProfileTagResponse::from(tag))))
}

#[utoipa::path(
    patch,
    path = "/profile-tags/{id}",
    tag = "revivals",
    summary = "Rename or deactivate profile tag",
    params(("id" = uuid::Uuid, Path, description = "Profile tag ID")),
    request_body = ProfileTagUpdate,
    responses(
        (status = 200, description = "Profile tag updated", body = ProfileTagResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Profile tag not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_profile_tag(
    State(state): State<AppState>,
    Path(id): Path<ProfileTagId>,
    current_user: RequiresPermission<resource::ProfileTags, operation::UpdateAll>,
    Json(update): Json<ProfileTagUpdate>,
) -> Result<Json<ProfileTagResponse>> {
    let service_id = current_user.tenant()?;
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(Error::BadRequest {
            message: "Profile tag name cannot be empty".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_profile_tag(&mut conn, service_id, id).await?;
    // The slug is kept so links built on it keep working after a rename
    let tag = ProfileTags::new(&mut conn)
        .update(
            id,
            &ProfileTagUpdateDBRequest {
                name: update.name.map(|n| n.trim().to_string()),
                is_active: update.is_active,
            },
        )
        .await?;
    Ok(Json(ProfileTagResponse::from(tag)))
}

#[utoipa::path(
    delete,
    path = "/profile-tags/{id}",
    tag = "revivals",
    summary = "Delete profile tag",
    params(("id" = uuid::Uuid, Path, description = "Profile tag ID")),
    responses(
        (status = 204, description = "Profile tag deleted"),
        (status = 403, description = "Forbidden, or the tag is reserved"),
        (status = 404, description = "Profile tag not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_profile_tag(
    State(state): State<AppState>,
    Path(id): Path<ProfileTagId>,
    current_user: RequiresPermission<resource::ProfileTags, operation::DeleteAll>,
) -> Result<StatusCode> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_profile_tag(&mut conn, service_id, id).await?;
    ProfileTags::new(&mut conn).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/profile-tags/objects",
    tag = "revivals",
    summary = "Tag an object",
    description = "Replaces the profile tags of a billed or published object. Tags of other services are ignored.",
    request_body = ObjectTagsRequest,
    responses(
        (status = 200, description = "Tags now attached to the object", body = ObjectTagsRequest),
        (status = 400, description = "Missing model name"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn set_object_tags(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::ProfileTags, operation::UpdateAll>,
    Json(request): Json<ObjectTagsRequest>,
) -> Result<Json<ObjectTagsRequest>> {
    let service_id = current_user.tenant()?;
    let model_name = request.model_name.trim();
    if model_name.is_empty() {
        return Err(Error::BadRequest {
            message: "model_name is required".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = ProfileTags::new(&mut conn);
    repo.set_object_tags(service_id, model_name, request.object_id, &request.tag_ids)
        .await?;
    let tag_ids = repo.object_tag_ids(model_name, request.object_id).await?;
    Ok(Json(ObjectTagsRequest {
        model_name: model_name.to_string(),
        object_id: request.object_id,
        tag_ids,
    }))
}
