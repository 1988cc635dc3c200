//! HTTP handlers for the current service's settings.

use axum::{Json, extract::State};
use tracing::info;

use crate::{
    AppState,
    api::models::services::{ConfigResponse, ConfigUpdate, InvoicingConfigResponse, InvoicingConfigUpdate},
    auth::{
        permissions::{RequiresPermission, operation, resource},
        utils::looks_like_email,
    },
    db::{
        errors::DbError,
        handlers::Services,
        models::services::{ConfigUpdateDBRequest, InvoicingConfigUpdateDBRequest, SmsSendingMethod},
    },
    errors::{Error, Result},
};

#[utoipa::path(
    get,
    path = "/config",
    tag = "config",
    summary = "Get service settings",
    responses(
        (status = 200, description = "Settings of the current service", body = ConfigResponse),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_config(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Config, operation::ReadAll>,
) -> Result<Json<ConfigResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let config = Services::new(&mut conn).get_config(service_id).await?;
    Ok(Json(ConfigResponse::from(config)))
}

#[utoipa::path(
    patch,
    path = "/config",
    tag = "config",
    summary = "Update service settings",
    request_body = ConfigUpdate,
    responses(
        (status = 200, description = "Settings updated", body = ConfigResponse),
        (status = 400, description = "Invalid settings"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_config(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Config, operation::UpdateAll>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigResponse>> {
    let service_id = current_user.tenant()?;
    if let Some(email) = update.contact_email.as_deref()
        && !looks_like_email(email.trim())
    {
        return Err(Error::BadRequest {
            message: format!("'{email}' is not a valid email address"),
        });
    }
    if let Some(precision) = update.decimal_precision
        && !(0..=4).contains(&precision)
    {
        return Err(Error::BadRequest {
            message: "decimal_precision must be between 0 and 4".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut services = Services::new(&mut conn);
    // An HTTP gateway needs a URL template, either already stored or in this update
    if update.sms_sending_method == Some(SmsSendingMethod::HttpApi) && update.sms_api_script_url.is_none() {
        let current = services.get_config(service_id).await?;
        if current.sms_api_script_url.is_none() {
            return Err(Error::BadRequest {
                message: "sms_api_script_url is required to send SMS through an HTTP gateway".to_string(),
            });
        }
    }

    let config = services.update_config(service_id, &ConfigUpdateDBRequest::from(update)).await?;
    info!(service_id = %config.service_id, "Service settings updated");
    Ok(Json(ConfigResponse::from(config)))
}

#[utoipa::path(
    get,
    path = "/invoicing-config",
    tag = "config",
    summary = "Get invoicing settings",
    responses(
        (status = 200, description = "Invoicing settings of the current service", body = InvoicingConfigResponse),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_invoicing_config(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Config, operation::ReadAll>,
) -> Result<Json<InvoicingConfigResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let config = Services::new(&mut conn).get_invoicing_config(service_id).await?;
    Ok(Json(InvoicingConfigResponse::from(config)))
}

#[utoipa::path(
    patch,
    path = "/invoicing-config",
    tag = "config",
    summary = "Update invoicing settings",
    request_body = InvoicingConfigUpdate,
    responses(
        (status = 200, description = "Invoicing settings updated", body = InvoicingConfigResponse),
        (status = 400, description = "Invalid delays"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_invoicing_config(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Config, operation::UpdateAll>,
    Json(update): Json<InvoicingConfigUpdate>,
) -> Result<Json<InvoicingConfigResponse>> {
    let service_id = current_user.tenant()?;
    update.validate().map_err(|message| Error::BadRequest { message })?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let config = Services::new(&mut conn)
        .update_invoicing_config(service_id, &InvoicingConfigUpdateDBRequest::from(update))
        .await?;
    Ok(Json(InvoicingConfigResponse::from(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::groups::COMMUNITY_GROUP;
    use crate::test_utils::{add_to_group, authenticated, create_test_member, create_test_service, create_test_state};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/config", get(get_config).patch(update_config))
            .route("/invoicing-config", get(get_invoicing_config).patch(update_invoicing_config))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_owner_updates_config(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        let config: ConfigResponse = authenticated(server.get("/config"), &owner, Some(service.id)).await.json();
        assert_eq!(config.company_name, "Shop");

        let config: ConfigResponse = authenticated(server.patch("/config"), &owner, Some(service.id))
            .json(&json!({"currency_code": "xaf", "sms_sending_method": "queue"}))
            .await
            .json();
        assert_eq!(config.currency_code, "XAF");
        assert_eq!(config.sms_sending_method, SmsSendingMethod::Queue);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_http_gateway_needs_url(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        authenticated(server.patch("/config"), &owner, Some(service.id))
            .json(&json!({"sms_sending_method": "http_api"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        authenticated(server.patch("/config"), &owner, Some(service.id))
            .json(&json!({
                "sms_sending_method": "http_api",
                "sms_api_script_url": "https://sms.example.com/send?from=$label&to=$recipient&text=$text"
            }))
            .await
            .assert_status_ok();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_invoicing_config_validation(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let server = server(pool).await;

        let config: InvoicingConfigResponse = authenticated(server.patch("/invoicing-config"), &owner, Some(service.id))
            .json(&json!({"gap": 10, "reminder_delay": 2}))
            .await
            .json();
        assert_eq!(config.gap, 10);
        assert_eq!(config.reminder_delay, 2);

        authenticated(server.patch("/invoicing-config"), &owner, Some(service.id))
            .json(&json!({"overdue_delay": 0}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_community_cannot_read_config(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let customer = create_test_member(&pool, "customer").await;
        add_to_group(&pool, service.id, COMMUNITY_GROUP, customer.id).await;
        let server = server(pool).await;

        authenticated(server.get("/config"), &customer, Some(service.id))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }
}
