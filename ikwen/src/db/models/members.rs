//! Database models for members.

use crate::types::MemberId;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

/// Database request for creating a new member
#[derive(Debug, Clone, Default)]
pub struct MemberCreateDBRequest {
    pub username: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub language: Option<String>,
    pub password_hash: Option<String>,
    pub is_ghost: bool,
    pub is_iao: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
}

/// Database request for updating a member. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemberUpdateDBRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub language: Option<String>,
    pub password_hash: Option<String>,
    pub is_ghost: Option<bool>,
    pub is_iao: Option<bool>,
    pub is_staff: Option<bool>,
    pub is_active: Option<bool>,
}

/// Database response for a member
#[derive(Debug, Clone, FromRow)]
pub struct MemberDBResponse {
    pub id: MemberId,
    pub username: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub language: String,
    pub password_hash: Option<String>,
    pub is_ghost: bool,
    pub is_iao: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub is_active: bool,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl MemberDBResponse {
    /// Placeholder addresses are generated for members who registered without an email and are
    /// never mailed.
    pub fn deliverable_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .filter(|email| !(email.starts_with("__") && email.ends_with("__@ikwen.com")))
    }
}
