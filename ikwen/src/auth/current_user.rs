//! Extractors for the authenticated member and the tenant of a request.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use sqlx::PgConnection;
use tracing::{instrument, trace};

use crate::{
    AppState,
    api::models::members::{CurrentUser, TenantAccess},
    auth::session,
    config::Config,
    db::{
        errors::DbError,
        handlers::{Groups, Members, Repository, Services},
        models::{groups::SUDO_GROUP, members::MemberDBResponse},
    },
    errors::{Error, Result},
    types::ServiceId,
};

/// Header naming the tenant a request is made for
pub const SERVICE_HEADER: &str = "x-ikwen-service";

/// The tenant named by the request, falling back to the configured default
pub fn requested_tenant(parts: &Parts, config: &Config) -> Result<Option<ServiceId>> {
    match parts.headers.get(SERVICE_HEADER) {
        Some(value) => {
            let id = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| Error::BadRequest {
                    message: format!("Invalid {SERVICE_HEADER} header"),
                })?;
            Ok(Some(id))
        }
        None => Ok(config.default_service_id),
    }
}

/// Session token from the session cookie, or from an `Authorization: Bearer` header
fn session_token(parts: &Parts, config: &Config) -> Option<String> {
    let cookie_name = &config.auth.native.session.cookie_name;
    let from_cookie = parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|c| c.trim().split_once('='))
        .find(|(name, value)| name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string());
    if from_cookie.is_some() {
        return from_cookie;
    }
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

/// Work out what a member may do in a service
#[instrument(skip(conn, member), fields(member_id = %crate::types::abbrev_uuid(&member.id)), err)]
pub async fn resolve_access(conn: &mut PgConnection, service_id: ServiceId, member: &MemberDBResponse) -> Result<TenantAccess> {
    let service = Services::new(&mut *conn).get_by_id(service_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Service".to_string(),
        id: service_id.to_string(),
    })?;
    if service.member_id == member.id {
        return Ok(TenantAccess::Full);
    }

    let mut groups = Groups::new(&mut *conn);
    let memberships = groups.member_groups(service_id, member.id).await?;
    if memberships.is_empty() {
        return Ok(TenantAccess::Outsider);
    }
    if memberships.iter().any(|g| g.name == SUDO_GROUP) {
        return Ok(TenantAccess::Full);
    }
    Ok(TenantAccess::Granted(groups.effective_permissions(service_id, member.id).await?))
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = session_token(parts, &state.config).ok_or_else(|| {
            trace!("No session credentials found in request");
            Error::Unauthenticated { message: None }
        })?;
        let claims = session::verify_session_token(&token, &state.config)?;
        let service_id = requested_tenant(parts, &state.config)?;

        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        // Deactivated members lose their sessions immediately
        let member = Members::new(&mut conn)
            .get_by_id(claims.sub)
            .await?
            .filter(|m| m.is_active && !m.is_ghost)
            .ok_or(Error::Unauthenticated { message: None })?;

        let access = match service_id {
            Some(service_id) => resolve_access(&mut conn, service_id, &member).await?,
            None => TenantAccess::Outsider,
        };

        Ok(CurrentUser {
            id: member.id,
            username: member.username,
            email: member.email,
            first_name: member.first_name,
            full_name: member.full_name,
            is_superuser: member.is_superuser,
            is_staff: member.is_staff,
            is_iao: member.is_iao,
            service_id,
            access,
        })
    }
}

/// Tenant of a request that needs no authentication (registration, password recovery)
#[derive(Debug, Clone, Copy)]
pub struct Tenant(pub ServiceId);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        requested_tenant(parts, &state.config)?.map(Tenant).ok_or_else(|| Error::BadRequest {
            message: format!("No service selected: send the {SERVICE_HEADER} header"),
        })
    }
}
