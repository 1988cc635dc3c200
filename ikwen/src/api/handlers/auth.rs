use axum::{
    Json,
    extract::{Path, State},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    AppState,
    api::models::{
        auth::{
            AuthResponse, AuthSuccessResponse, ChangePasswordRequest, LoginRequest, LoginResponse, LogoutResponse,
            PasswordResetConfirmRequest, PasswordResetRequest, PasswordResetResponse, RegisterRequest, RegisterResponse, RegistrationInfo,
        },
        members::{CurrentUser, MemberResponse},
    },
    auth::{
        current_user::Tenant,
        password::{self, Argon2Params},
        session,
        utils::{compose_full_name, looks_like_email, normalize_phone, normalize_username, placeholder_email},
    },
    config::{Config, PasswordRecoveryMethod},
    db::{
        errors::DbError,
        handlers::{Events, Groups, Members, PasswordResetTokens, ProfileTags, Repository, Services},
        models::{
            events::{ConsoleEventCreateDBRequest, EventType},
            groups::COMMUNITY_GROUP,
            members::{MemberCreateDBRequest, MemberDBResponse, MemberUpdateDBRequest},
        },
    },
    errors::Error,
    types::abbrev_uuid,
};

/// Hash a password on a blocking thread with the configured cost
async fn hash_password(config: &Config, password: &str) -> Result<String, Error> {
    let password = password.to_string();
    let params = Argon2Params::from(&config.auth.native.password);
    tokio::task::spawn_blocking(move || password::hash_string_with_params(&password, Some(params)))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password hashing task: {e}"),
        })?
}

async fn verify_password(password: &str, hash: &str) -> Result<bool, Error> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || password::verify_string(&password, &hash))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password verification task: {e}"),
        })?
}

fn invalid_credentials() -> Error {
    Error::Unauthenticated {
        message: Some("Invalid username or password".to_string()),
    }
}

/// Get registration information
#[utoipa::path(
    get,
    path = "/authentication/register",
    tag = "authentication",
    responses(
        (status = 200, description = "Registration info", body = RegistrationInfo),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_registration_info(State(state): State<AppState>) -> Result<Json<RegistrationInfo>, Error> {
    let enabled = state.config.auth.native.allow_registration;
    Ok(Json(RegistrationInfo {
        enabled,
        message: if enabled {
            "Registration is enabled".to_string()
        } else {
            "Registration is disabled".to_string()
        },
    }))
}

/// Register a new member in the current service's community.
///
/// A ghost account (created for a customer before they signed up) matching the username or
/// phone is converted in place.
#[utoipa::path(
    post,
    path = "/authentication/register",
    request_body = RegisterRequest,
    tag = "authentication",
    params(("X-Ikwen-Service" = Option<String>, Header, description = "Service to join")),
    responses(
        (status = 201, description = "Member registered successfully", body = AuthResponse),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Username or phone already in use"),
    )
)]
#[tracing::instrument(skip_all, fields(service_id = %abbrev_uuid(&service_id)))]
pub async fn register(
    State(state): State<AppState>,
    Tenant(service_id): Tenant,
    Json(request): Json<RegisterRequest>,
) -> Result<RegisterResponse, Error> {
    if !state.config.auth.native.allow_registration {
        return Err(Error::BadRequest {
            message: "Member registration is disabled".to_string(),
        });
    }

    let username = normalize_username(&request.username);
    if username.is_empty() {
        return Err(Error::BadRequest {
            message: "Username is required".to_string(),
        });
    }
    let email = request
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .or_else(|| looks_like_email(&username).then(|| username.clone()));
    if let Some(email) = &email
        && !looks_like_email(email)
    {
        return Err(Error::BadRequest {
            message: format!("'{email}' is not a valid email address"),
        });
    }
    let phone = request.phone.as_deref().map(normalize_phone).filter(|p| !p.is_empty());
    password::validate_new_password(&request.password, Some(&request.password2), &state.config.auth.native.password)?;

    let mut tx = state.db.begin().await.map_err(DbError::from)?;

    let tenant_config = {
        let mut services = Services::new(&mut tx);
        services.get_by_id(service_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Service".to_string(),
            id: service_id.to_string(),
        })?;
        services.get_config(service_id).await?
    };
    if tenant_config.register_with_email && email.is_none() {
        return Err(Error::BadRequest {
            message: "An email address is required".to_string(),
        });
    }

    let password_hash = hash_password(&state.config, &request.password).await?;
    let full_name = compose_full_name(&request.first_name, &request.last_name);

    let member = {
        let mut members = Members::new(&mut tx);
        match members.find_ghost(&username, phone.as_deref()).await? {
            Some(ghost) => {
                debug!(member_id = %abbrev_uuid(&ghost.id), "Converting ghost account");
                members
                    .update(
                        ghost.id,
                        &MemberUpdateDBRequest {
                            username: Some(username.clone()),
                            email: Some(email.clone().unwrap_or_else(|| placeholder_email(&username))),
                            phone: phone.clone(),
                            first_name: Some(request.first_name.trim().to_string()),
                            last_name: Some(request.last_name.trim().to_string()),
                            full_name: Some(full_name),
                            gender: request.gender.clone(),
                            dob: request.dob,
                            password_hash: Some(password_hash),
                            is_ghost: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            None => {
                if members.get_by_username(&username).await?.is_some() {
                    return Err(Error::Conflict {
                        message: "This username is already taken".to_string(),
                    });
                }
                if let Some(phone) = &phone
                    && members.get_by_phone(phone).await?.is_some_and(|m| !m.is_ghost)
                {
                    return Err(Error::Conflict {
                        message: "An account with this phone already exists".to_string(),
                    });
                }
                members
                    .create(&MemberCreateDBRequest {
                        username: username.clone(),
                        email: Some(email.clone().unwrap_or_else(|| placeholder_email(&username))),
                        phone: phone.clone(),
                        first_name: request.first_name.trim().to_string(),
                        last_name: request.last_name.trim().to_string(),
                        full_name,
                        gender: request.gender.clone(),
                        dob: request.dob,
                        password_hash: Some(password_hash),
                        ..Default::default()
                    })
                    .await?
            }
        }
    };

    Groups::new(&mut tx).add_member_to_named(service_id, COMMUNITY_GROUP, member.id).await?;
    ProfileTags::new(&mut tx).refresh_member_counts(service_id).await?;
    Events::new(&mut tx)
        .create(&ConsoleEventCreateDBRequest {
            service_id,
            member_id: Some(member.id),
            event_type: EventType::WelcomeEvent,
            object_id: None,
        })
        .await?;

    tx.commit().await.map_err(DbError::from)?;
    info!(member_id = %abbrev_uuid(&member.id), "Member registered");

    if let Some(to) = member.deliverable_email().map(str::to_string) {
        let notifier = state.notifier.clone();
        let first_name = member.first_name.clone();
        state.notifier.spawn("welcome mail", async move {
            let email = notifier.email();
            let sender = email.tenant_sender(&tenant_config.company_name, tenant_config.contact_email.as_deref());
            email
                .send_welcome_email(&sender, &to, &first_name, &tenant_config.company_name)
                .await
        });
    }

    let token = session::create_session_token(&member, &state.config)?;
    let cookie = session::session_cookie(&token, &state.config);

    Ok(RegisterResponse {
        auth_response: AuthResponse {
            member: MemberResponse::from(member),
            message: "Registration successful".to_string(),
        },
        cookie,
    })
}

/// Login with a username (or email) and a password
#[utoipa::path(
    post,
    path = "/authentication/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Result<LoginResponse, Error> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut members = Members::new(&mut conn);

    let login = request.username.trim();
    let member = match members.get_by_username(&normalize_username(login)).await? {
        Some(member) => Some(member),
        None => members.get_by_email(login).await?,
    }
    .filter(|m| m.is_active && !m.is_ghost)
    .ok_or_else(invalid_credentials)?;

    let password_hash = member.password_hash.as_deref().ok_or_else(invalid_credentials)?;
    if !verify_password(&request.password, password_hash).await? {
        return Err(invalid_credentials());
    }
    members.touch_last_login(member.id).await?;

    let token = session::create_session_token(&member, &state.config)?;
    let cookie = session::session_cookie(&token, &state.config);

    Ok(LoginResponse {
        auth_response: AuthResponse {
            member: MemberResponse::from(member),
            message: "Login successful".to_string(),
        },
        cookie,
    })
}

/// Logout (clear session)
#[utoipa::path(
    post,
    path = "/authentication/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Logout successful", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>) -> Result<LogoutResponse, Error> {
    Ok(LogoutResponse {
        auth_response: AuthSuccessResponse {
            message: "Logout successful".to_string(),
        },
        cookie: session::expired_cookie(&state.config),
    })
}

async fn find_account(conn: &mut sqlx::PgConnection, login: &str) -> Result<Option<MemberDBResponse>, Error> {
    let mut members = Members::new(conn);
    let login = login.trim();
    let member = if looks_like_email(login) {
        members.get_by_email(login).await?
    } else {
        match members.get_by_username(&normalize_username(login)).await? {
            Some(member) => Some(member),
            None => {
                let phone = normalize_phone(login);
                if phone.is_empty() { None } else { members.get_by_phone(&phone).await? }
            }
        }
    };
    Ok(member.filter(|m| m.is_active && !m.is_ghost))
}

/// Request a password reset, by mail or SMS depending on the recovery method.
///
/// Always answers success so that accounts cannot be enumerated.
#[utoipa::path(
    post,
    path = "/authentication/password-resets",
    request_body = PasswordResetRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Reset instructions sent if the account exists", body = PasswordResetResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Tenant(service_id): Tenant,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<PasswordResetResponse>, Error> {
    let method = state.config.auth.native.password_recovery_method;
    let mut tx = state.db.begin().await.map_err(DbError::from)?;

    let member = find_account(&mut tx, &request.login).await?;
    // A random id hides whether the account exists
    let mut reset_id = Uuid::new_v4();

    if let Some(member) = member {
        match method {
            PasswordRecoveryMethod::Mail => {
                if let Some(to) = member.deliverable_email().map(str::to_string) {
                    let (raw_token, token) = PasswordResetTokens::new(&mut tx).create_for_member(member.id, &state.config).await?;
                    let notifier = state.notifier.clone();
                    let name = member.first_name.clone();
                    state.notifier.spawn("password reset mail", async move {
                        notifier
                            .email()
                            .send_password_reset_email(&to, Some(&name), &token.id, &raw_token)
                            .await
                    });
                }
            }
            PasswordRecoveryMethod::Sms => {
                if let Some(phone) = member.phone.clone() {
                    let (code, token) = PasswordResetTokens::new(&mut tx).create_for_member(member.id, &state.config).await?;
                    reset_id = token.id;
                    let tenant_config = Services::new(&mut tx).get_config(service_id).await?;
                    let notifier = state.notifier.clone();
                    let db = state.db.clone();
                    state.notifier.spawn("password reset SMS", async move {
                        let text = format!("Your {} password reset code is {code}", tenant_config.company_name);
                        notifier
                            .send_tenant_sms(&db, &db.wallets(), &tenant_config, &phone, &text)
                            .await
                            .map(|_| ())
                    });
                }
            }
        }
    }
    tx.commit().await.map_err(DbError::from)?;

    Ok(Json(match method {
        PasswordRecoveryMethod::Mail => PasswordResetResponse {
            message: "If an account with that login exists, a password reset link has been sent.".to_string(),
            reset_id: None,
        },
        PasswordRecoveryMethod::Sms => PasswordResetResponse {
            message: "If an account with that login exists, a reset code has been sent by SMS.".to_string(),
            reset_id: Some(reset_id),
        },
    }))
}

/// Confirm a password reset with its token
#[utoipa::path(
    post,
    path = "/authentication/password-resets/{token_id}/confirm",
    request_body = PasswordResetConfirmRequest,
    tag = "authentication",
    params(("token_id" = String, Path, description = "Reset id from the link or the reset request")),
    responses(
        (status = 200, description = "Password reset successful", body = PasswordResetResponse),
        (status = 400, description = "Invalid or expired token"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Path(token_id): Path<Uuid>,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> Result<Json<PasswordResetResponse>, Error> {
    password::validate_new_password(
        &request.new_password,
        request.new_password2.as_deref(),
        &state.config.auth.native.password,
    )?;
    let new_password_hash = hash_password(&state.config, &request.new_password).await?;

    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    let token = PasswordResetTokens::new(&mut tx)
        .find_valid_token_by_id(token_id, request.token.trim())
        .await?
        .ok_or_else(|| Error::BadRequest {
            message: "Invalid or expired reset token".to_string(),
        })?;

    Members::new(&mut tx)
        .update(
            token.member_id,
            &MemberUpdateDBRequest {
                password_hash: Some(new_password_hash),
                ..Default::default()
            },
        )
        .await?;
    // Invalidate all tokens for this member, including the current one
    PasswordResetTokens::new(&mut tx).invalidate_for_member(token.member_id).await?;
    tx.commit().await.map_err(DbError::from)?;

    Ok(Json(PasswordResetResponse {
        message: "Password has been reset successfully".to_string(),
        reset_id: None,
    }))
}

/// Change password for the authenticated member
#[utoipa::path(
    post,
    path = "/authentication/password-change",
    request_body = ChangePasswordRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Password changed successfully", body = AuthSuccessResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Current password is incorrect"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AuthSuccessResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut members = Members::new(&mut conn);

    let member = members.get_by_id(current_user.id).await?.ok_or(Error::Unauthenticated { message: None })?;
    let current_hash = member.password_hash.as_deref().unwrap_or_default();
    if current_hash.is_empty() || !verify_password(&request.current_password, current_hash).await? {
        return Err(Error::Unauthenticated {
            message: Some("Current password is incorrect".to_string()),
        });
    }

    password::validate_new_password(
        &request.new_password,
        request.new_password2.as_deref(),
        &state.config.auth.native.password,
    )?;
    let new_password_hash = hash_password(&state.config, &request.new_password).await?;
    members
        .update(
            member.id,
            &MemberUpdateDBRequest {
                password_hash: Some(new_password_hash),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(AuthSuccessResponse {
        message: "Password changed successfully".to_string(),
    }))
}
