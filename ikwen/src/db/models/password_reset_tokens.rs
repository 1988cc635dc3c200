//! Database models for password reset tokens.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::types::MemberId;

/// Database entity model. Only the Argon2 hash of the secret is stored.
#[derive(Debug, Clone, FromRow)]
pub struct PasswordResetToken {
    pub id: Uuid,
    pub member_id: MemberId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl PasswordResetToken {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now <= self.expires_at
    }
}

/// Request for creating a password reset token
#[derive(Debug, Clone)]
pub struct PasswordResetTokenCreateRequest {
    pub member_id: MemberId,
    /// The secret handed to the member: a URL-safe token for mail, a 6-digit code for SMS
    pub raw_token: String,
    pub expires_at: DateTime<Utc>,
    pub argon2_params: crate::auth::password::Argon2Params,
}

/// Request for updating a password reset token (mark as used)
#[derive(Debug, Clone)]
pub struct PasswordResetTokenUpdateRequest {
    pub used_at: Option<DateTime<Utc>>,
}

/// Response type (same as entity)
pub type PasswordResetTokenResponse = PasswordResetToken;

/// Filter for password reset tokens
#[derive(Debug, Clone)]
pub struct PasswordResetTokenFilter {
    pub member_id: Option<MemberId>,
    pub skip: i64,
    pub limit: i64,
}
