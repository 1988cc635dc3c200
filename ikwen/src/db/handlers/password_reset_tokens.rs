//! Database repository for password reset tokens.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::{password, utils::generate_sms_code},
    config::{Config, PasswordRecoveryMethod},
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::password_reset_tokens::{
            PasswordResetToken, PasswordResetTokenCreateRequest, PasswordResetTokenFilter, PasswordResetTokenResponse,
            PasswordResetTokenUpdateRequest,
        },
    },
    types::{MemberId, abbrev_uuid},
};

const TOKEN_COLUMNS: &str = "id, member_id, token_hash, expires_at, created_at, used_at";

pub struct PasswordResetTokens<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for PasswordResetTokens<'c> {
    type CreateRequest = PasswordResetTokenCreateRequest;
    type UpdateRequest = PasswordResetTokenUpdateRequest;
    type Response = PasswordResetTokenResponse;
    type Id = Uuid;
    type Filter = PasswordResetTokenFilter;

    #[instrument(skip(self, request), fields(member_id = %abbrev_uuid(&request.member_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let token_hash = password::hash_string_with_params(&request.raw_token, Some(request.argon2_params))
            .map_err(|e| DbError::Other(anyhow::anyhow!(e)))?;

        let token = sqlx::query_as::<_, PasswordResetToken>(&format!(
            "INSERT INTO password_reset_tokens (member_id, token_hash, expires_at) VALUES ($1, $2, $3) RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(request.member_id)
        .bind(token_hash)
        .bind(request.expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(token)
    }

    #[instrument(skip(self, id), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let token = sqlx::query_as::<_, PasswordResetToken>(&format!("SELECT {TOKEN_COLUMNS} FROM password_reset_tokens WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(token)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let tokens =
            sqlx::query_as::<_, PasswordResetToken>(&format!("SELECT {TOKEN_COLUMNS} FROM password_reset_tokens WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;

        Ok(tokens.into_iter().map(|t| (t.id, t)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let tokens = sqlx::query_as::<_, PasswordResetToken>(&format!(
            r#"
            SELECT {TOKEN_COLUMNS} FROM password_reset_tokens
            WHERE ($1::uuid IS NULL OR member_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.member_id)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(tokens)
    }

    #[instrument(skip(self, id, request), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let token = sqlx::query_as::<_, PasswordResetToken>(&format!(
            "UPDATE password_reset_tokens SET used_at = COALESCE($2, used_at) WHERE id = $1 RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(id)
        .bind(request.used_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(token)
    }

    #[instrument(skip(self, id), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

impl<'c> PasswordResetTokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create a reset token for a member and return the raw secret alongside the stored row.
    /// The secret is a URL-safe token in mail recovery mode and a 6-digit code in SMS mode.
    #[instrument(skip(self, config), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn create_for_member(&mut self, member_id: MemberId, config: &Config) -> Result<(String, PasswordResetToken)> {
        let raw_token = match config.auth.native.password_recovery_method {
            PasswordRecoveryMethod::Mail => password::generate_reset_token(),
            PasswordRecoveryMethod::Sms => generate_sms_code(),
        };
        let expires_at = Utc::now()
            + chrono::Duration::from_std(config.auth.native.password_reset_token_duration).unwrap_or(chrono::Duration::minutes(30));

        let request = PasswordResetTokenCreateRequest {
            member_id,
            raw_token: raw_token.clone(),
            expires_at,
            argon2_params: password::Argon2Params::from(&config.auth.native.password),
        };

        let token = self.create(&request).await?;
        Ok((raw_token, token))
    }

    /// Find a valid token by ID and verify the raw secret
    #[instrument(skip(self, raw_token), err)]
    pub async fn find_valid_token_by_id(&mut self, token_id: Uuid, raw_token: &str) -> Result<Option<PasswordResetToken>> {
        let Some(token) = self.get_by_id(token_id).await? else {
            return Ok(None);
        };
        if !token.is_usable_at(Utc::now()) {
            return Ok(None);
        }

        match password::verify_string(raw_token, &token.token_hash) {
            Ok(true) => Ok(Some(token)),
            Ok(false) => Ok(None),
            Err(e) => {
                tracing::error!("Token verification error for token {}: {:?}", token_id, e);
                Ok(None)
            }
        }
    }

    /// Invalidate all tokens of a member
    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn invalidate_for_member(&mut self, member_id: MemberId) -> Result<u64> {
        let result = sqlx::query("UPDATE password_reset_tokens SET used_at = NOW() WHERE member_id = $1 AND used_at IS NULL")
            .bind(member_id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_config, create_test_member};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_token_is_single_use(pool: PgPool) {
        let member = create_test_member(&pool, "roger").await;
        let config = create_test_config();

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PasswordResetTokens::new(&mut conn);

        let (raw, token) = repo.create_for_member(member.id, &config).await.unwrap();
        assert_ne!(raw, token.token_hash);
        assert!(repo.find_valid_token_by_id(token.id, &raw).await.unwrap().is_some());
        assert!(repo.find_valid_token_by_id(token.id, "wrong").await.unwrap().is_none());

        assert_eq!(repo.invalidate_for_member(member.id).await.unwrap(), 1);
        assert!(repo.find_valid_token_by_id(token.id, &raw).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_sms_mode_issues_numeric_code(pool: PgPool) {
        let member = create_test_member(&pool, "roger").await;
        let mut config = create_test_config();
        config.auth.native.password_recovery_method = PasswordRecoveryMethod::Sms;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PasswordResetTokens::new(&mut conn);
        let (code, token) = repo.create_for_member(member.id, &config).await.unwrap();

        assert_eq!(code.len(), 6);
        assert!(repo.find_valid_token_by_id(token.id, &code).await.unwrap().is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_expired_token_rejected(pool: PgPool) {
        let member = create_test_member(&pool, "roger").await;
        let config = create_test_config();

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PasswordResetTokens::new(&mut conn);
        let token = repo
            .create(&PasswordResetTokenCreateRequest {
                member_id: member.id,
                raw_token: "secret".into(),
                expires_at: Utc::now() - chrono::Duration::minutes(1),
                argon2_params: password::Argon2Params::from(&config.auth.native.password),
            })
            .await
            .unwrap();

        assert!(repo.find_valid_token_by_id(token.id, "secret").await.unwrap().is_none());
    }
}
