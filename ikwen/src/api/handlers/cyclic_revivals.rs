use crate::api::handlers::profile_tags::tenant_profile_tag;
use crate::api::models::pagination::{PaginatedResponse, Pagination};
use crate::api::models::revivals::{CyclicRevivalCreate, CyclicRevivalResponse, CyclicRevivalUpdate};
use crate::auth::permissions::{RequiresPermission, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{CyclicRevivals, Repository, cyclic_revivals::CyclicRevivalFilter, repository::ListQuery};
use crate::db::models::revivals::{CyclicRevivalCreateDBRequest, CyclicRevivalDBResponse, CyclicRevivalUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::revival::schedule::Recurrence;
use crate::types::{CyclicRevivalId, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::NaiveDate;
use sqlx::PgConnection;
use tracing::info;

async fn tenant_cyclic_revival(conn: &mut PgConnection, service_id: ServiceId, id: CyclicRevivalId) -> Result<CyclicRevivalDBResponse> {
    CyclicRevivals::new(conn)
        .get_by_id(id)
        .await?
        .filter(|r| r.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Cyclic revival".to_string(),
            id: id.to_string(),
        })
}

fn bad_request(message: impl Into<String>) -> Error {
    Error::BadRequest { message: message.into() }
}

/// Checks the schedule a cyclic revival would have once saved
fn validate_schedule(
    hour_of_sending: i32,
    days_cycle: Option<i32>,
    weekdays: &[i32],
    month_days: &[i32],
    next_run_on: NaiveDate,
    end_on: Option<NaiveDate>,
) -> Result<()> {
    if !(0..=23).contains(&hour_of_sending) {
        return Err(bad_request("hour_of_sending must be between 0 and 23"));
    }
    if weekdays.iter().any(|d| !(1..=7).contains(d)) {
        return Err(bad_request("day_of_week_list only takes ISO weekdays, 1 to 7"));
    }
    if month_days.iter().any(|d| !(1..=31).contains(d)) {
        return Err(bad_request("day_of_month_list only takes days 1 to 31"));
    }
    if Recurrence::from_rules(days_cycle, weekdays, month_days).is_none() {
        return Err(bad_request("Set days_cycle, day_of_week_list or day_of_month_list"));
    }
    if end_on.is_some_and(|end| end < next_run_on) {
        return Err(bad_request("end_on cannot be before next_run_on"));
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/cyclic-revivals",
    tag = "revivals",
    summary = "List cyclic revivals",
    params(Pagination),
    responses(
        (status = 200, description = "Cyclic revivals of the current service", body = PaginatedResponse<CyclicRevivalResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_cyclic_revivals(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    current_user: RequiresPermission<resource::Revivals, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<CyclicRevivalResponse>>> {
    let service_id = current_user.tenant()?;
    let (skip, limit) = pagination.params();
    let filter = CyclicRevivalFilter {
        service_id,
        query: ListQuery::new(None, skip, limit),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = CyclicRevivals::new(&mut conn);
    let revivals = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        revivals.into_iter().map(CyclicRevivalResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    post,
    path = "/cyclic-revivals",
    tag = "revivals",
    summary = "Create cyclic revival",
    description = "Schedules a campaign sent to every member of a profile tag, first on `next_run_on` \
        at `hour_of_sending`, then on each date given by the recurrence rule.",
    request_body = CyclicRevivalCreate,
    responses(
        (status = 201, description = "Cyclic revival created", body = CyclicRevivalResponse),
        (status = 400, description = "Invalid schedule"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Profile tag not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_cyclic_revival(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Revivals, operation::CreateAll>,
    Json(create): Json<CyclicRevivalCreate>,
) -> Result<(StatusCode, Json<CyclicRevivalResponse>)> {
    let service_id = current_user.tenant()?;
    validate_schedule(
        create.hour_of_sending,
        create.days_cycle,
        &create.day_of_week_list,
        &create.day_of_month_list,
        create.next_run_on,
        create.end_on,
    )?;
    if create.mail_subject.trim().is_empty() {
        return Err(bad_request("mail_subject cannot be empty"));
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_profile_tag(&mut conn, service_id, create.profile_tag_id).await?;
    let revival = CyclicRevivals::new(&mut conn)
        .create(&CyclicRevivalCreateDBRequest {
            service_id,
            profile_tag_id: create.profile_tag_id,
            hour_of_sending: create.hour_of_sending,
            days_cycle: create.days_cycle,
            day_of_week_list: create.day_of_week_list,
            day_of_month_list: create.day_of_month_list,
            mail_subject: create.mail_subject.trim().to_string(),
            mail_content: create.mail_content,
            sms_text: create.sms_text,
            next_run_on: create.next_run_on,
            end_on: create.end_on,
        })
        .await?;
    info!(cyclic_revival_id = %revival.id, next_run_on = %revival.next_run_on, "Cyclic revival scheduled");
    Ok((StatusCode::CREATED, Json(CyclicRevivalResponse::from(revival))))
}

#[utoipa::path(
    get,
    path = "/cyclic-revivals/{id}",
    tag = "revivals",
    summary = "Get cyclic revival",
    params(("id" = uuid::Uuid, Path, description = "Cyclic revival ID")),
    responses(
        (status = 200, description = "Cyclic revival", body = CyclicRevivalResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Cyclic revival not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_cyclic_revival(
    State(state): State<AppState>,
    Path(id): Path<CyclicRevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::ReadAll>,
) -> Result<Json<CyclicRevivalResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let revival = tenant_cyclic_revival(&mut conn, service_id, id).await?;
    Ok(Json(CyclicRevivalResponse::from(revival)))
}

#[utoipa::path(
    patch,
    path = "/cyclic-revivals/{id}",
    tag = "revivals",
    summary = "Update cyclic revival",
    description = "A `days_cycle` takes precedence over the day lists; send `0` to drop it.",
    params(("id" = uuid::Uuid, Path, description = "Cyclic revival ID")),
    request_body = CyclicRevivalUpdate,
    responses(
        (status = 200, description = "Cyclic revival updated", body = CyclicRevivalResponse),
        (status = 400, description = "Invalid schedule"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Cyclic revival not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_cyclic_revival(
    State(state): State<AppState>,
    Path(id): Path<CyclicRevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::UpdateAll>,
    Json(update): Json<CyclicRevivalUpdate>,
) -> Result<Json<CyclicRevivalResponse>> {
    let service_id = current_user.tenant()?;
    if update.mail_subject.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(bad_request("mail_subject cannot be empty"));
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let current = tenant_cyclic_revival(&mut conn, service_id, id).await?;
    validate_schedule(
        update.hour_of_sending.unwrap_or(current.hour_of_sending),
        update.days_cycle.or(current.days_cycle),
        update.day_of_week_list.as_deref().unwrap_or(current.day_of_week_list.as_slice()),
        update.day_of_month_list.as_deref().unwrap_or(current.day_of_month_list.as_slice()),
        update.next_run_on.unwrap_or(current.next_run_on),
        update.end_on.or(current.end_on),
    )?;

    let revival = CyclicRevivals::new(&mut conn)
        .update(
            id,
            &CyclicRevivalUpdateDBRequest {
                hour_of_sending: update.hour_of_sending,
                days_cycle: update.days_cycle,
                day_of_week_list: update.day_of_week_list,
                day_of_month_list: update.day_of_month_list,
                mail_subject: update.mail_subject.map(|s| s.trim().to_string()),
                mail_content: update.mail_content,
                sms_text: update.sms_text,
                next_run_on: update.next_run_on,
                end_on: update.end_on,
                is_active: update.is_active,
            },
        )
        .await?;
    Ok(Json(CyclicRevivalResponse::from(revival)))
}

#[utoipa::path(
    delete,
    path = "/cyclic-revivals/{id}",
    tag = "revivals",
    summary = "Delete cyclic revival",
    params(("id" = uuid::Uuid, Path, description = "Cyclic revival ID")),
    responses(
        (status = 204, description = "Cyclic revival deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Cyclic revival not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_cyclic_revival(
    State(state): State<AppState>,
    Path(id): Path<CyclicRevivalId>,
    current_user: RequiresPermission<resource::Revivals, operation::DeleteAll>,
) -> Result<StatusCode> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_cyclic_revival(&mut conn, service_id, id).await?;
    CyclicRevivals::new(&mut conn).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::revivals::ProfileTagResponse;
    use crate::test_utils::{authenticated, create_test_member, create_test_service, create_test_state};
    use axum::routing::{get, post};
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/profile-tags", post(crate::api::handlers::profile_tags::create_profile_tag))
            .route("/cyclic-revivals", get(list_cyclic_revivals).post(create_cyclic_revival))
            .route(
                "/cyclic-revivals/{id}",
                get(get_cyclic_revival).patch(update_cyclic_revival).delete(delete_cyclic_revival),
            )
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    #[test]
    fn test_validate_schedule() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(validate_schedule(9, Some(7), &[], &[], day, None).is_ok());
        assert!(validate_schedule(9, None, &[1, 5], &[], day, Some(day)).is_ok());
        assert!(validate_schedule(24, Some(7), &[], &[], day, None).is_err());
        assert!(validate_schedule(9, None, &[], &[], day, None).is_err());
        assert!(validate_schedule(9, Some(0), &[], &[], day, None).is_err());
        assert!(validate_schedule(9, None, &[8], &[], day, None).is_err());
        assert!(validate_schedule(9, None, &[], &[0, 15], day, None).is_err());
        assert!(validate_schedule(9, Some(1), &[], &[], day, day.pred_opt()).is_err());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cyclic_revival_schedule_changes(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Gym").await;
        let server = server(pool).await;

        let tag: ProfileTagResponse = authenticated(server.post("/profile-tags"), &owner, Some(service.id))
            .json(&json!({"name": "Yoga"}))
            .await
            .json();

        let created = authenticated(server.post("/cyclic-revivals"), &owner, Some(service.id))
            .json(&json!({
                "profile_tag_id": tag.id,
                "hour_of_sending": 8,
                "days_cycle": 7,
                "mail_subject": "Your weekly class",
                "mail_content": "<p>See you on the mat, $client</p>",
                "next_run_on": "2026-03-02"
            }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let revival: CyclicRevivalResponse = created.json();
        assert!(revival.is_active);
        assert_eq!(revival.profile_tag_id, Some(tag.id));

        // Day lists only apply once the days cycle is dropped
        let updated: CyclicRevivalResponse = authenticated(server.patch(&format!("/cyclic-revivals/{}", revival.id)), &owner, Some(service.id))
            .json(&json!({"days_cycle": 0, "day_of_week_list": [1, 4]}))
            .await
            .json();
        assert_eq!(updated.day_of_week_list, vec![1, 4]);

        authenticated(server.patch(&format!("/cyclic-revivals/{}", revival.id)), &owner, Some(service.id))
            .json(&json!({"day_of_week_list": []}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        authenticated(server.patch(&format!("/cyclic-revivals/{}", revival.id)), &owner, Some(service.id))
            .json(&json!({"end_on": "2026-03-01"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let page: PaginatedResponse<CyclicRevivalResponse> =
            authenticated(server.get("/cyclic-revivals"), &owner, Some(service.id)).await.json();
        assert_eq!(page.total_count, 1);

        authenticated(server.delete(&format!("/cyclic-revivals/{}", revival.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cyclic_revival_needs_tag_of_the_service(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Gym").await;
        let other = create_test_service(&pool, owner.id, "Pool").await;
        let server = server(pool).await;

        let foreign_tag: ProfileTagResponse = authenticated(server.post("/profile-tags"), &owner, Some(other.id))
            .json(&json!({"name": "Swimming"}))
            .await
            .json();

        authenticated(server.post("/cyclic-revivals"), &owner, Some(service.id))
            .json(&json!({
                "profile_tag_id": foreign_tag.id,
                "hour_of_sending": 8,
                "day_of_month_list": [1],
                "mail_subject": "Monthly news",
                "mail_content": "<p>News</p>",
                "next_run_on": "2026-04-01"
            }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
