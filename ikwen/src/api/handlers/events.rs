//! HTTP handlers for the console feed and sending reports.

use axum::{
    Json,
    extract::{Query, State},
};

use crate::{
    AppState,
    api::models::{
        members::CurrentUser,
        pagination::PaginatedResponse,
        services::{EventResponse, ListEventsQuery, SendingReportResponse},
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Events, events::ConsoleEventFilter, repository::ListQuery},
    },
    errors::Result,
};

#[utoipa::path(
    get,
    path = "/events",
    tag = "events",
    summary = "List the current member's events",
    description = "Events addressed to the authenticated member across all services, newest first.",
    params(ListEventsQuery),
    responses(
        (status = 200, description = "Paginated events", body = PaginatedResponse<EventResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<EventResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = ConsoleEventFilter {
        member_id: current_user.id,
        service_id: query.service_id,
        query: ListQuery::new(None, skip, limit),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut events = Events::new(&mut conn);
    let data = events.list(&filter).await?;
    let total_count = events.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        data.into_iter().map(EventResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    get,
    path = "/sending-reports",
    tag = "events",
    summary = "List sending reports",
    description = "Reports of invoicing and revival batches sent by the current service.",
    responses(
        (status = 200, description = "Reports, newest first", body = [SendingReportResponse]),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_sending_reports(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Events, operation::ReadAll>,
) -> Result<Json<Vec<SendingReportResponse>>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let reports = Events::new(&mut conn).list_sending_reports(service_id).await?;
    Ok(Json(reports.into_iter().map(SendingReportResponse::from).collect()))
}
