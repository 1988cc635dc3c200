//! Database models for profile tags and revival campaigns.

use crate::billing::status::RevivalStatus;
use crate::types::{CyclicRevivalId, MemberId, ProfileTagId, RevivalId, ServiceId};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProfileTagCreateDBRequest {
    pub service_id: ServiceId,
    pub name: String,
    pub slug: String,
    pub is_reserved: bool,
    pub is_auto: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileTagUpdateDBRequest {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProfileTagDBResponse {
    pub id: ProfileTagId,
    pub service_id: ServiceId,
    pub name: String,
    pub slug: String,
    pub member_count: i32,
    pub is_active: bool,
    pub is_reserved: bool,
    pub is_auto: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RevivalCreateDBRequest {
    pub service_id: ServiceId,
    pub model_name: String,
    pub object_id: Uuid,
    pub mail_subject: String,
    pub mail_content: String,
}

#[derive(Debug, Clone, Default)]
pub struct RevivalUpdateDBRequest {
    pub mail_subject: Option<String>,
    pub mail_content: Option<String>,
    pub is_active: Option<bool>,
}

/// A smart revival: a mail campaign about one object, sent to members whose profile tags
/// intersect the object's tags
#[derive(Debug, Clone, FromRow)]
pub struct RevivalDBResponse {
    pub id: RevivalId,
    pub service_id: ServiceId,
    pub model_name: String,
    pub object_id: Uuid,
    pub mail_subject: String,
    pub mail_content: String,
    pub status: RevivalStatus,
    pub progress: i32,
    pub total: i32,
    pub run_on: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
}

/// A member targeted by a revival, with the member fields needed to address them
#[derive(Debug, Clone, FromRow)]
pub struct TargetDBResponse {
    pub revival_id: RevivalId,
    pub member_id: MemberId,
    pub revival_count: i32,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct CyclicRevivalCreateDBRequest {
    pub service_id: ServiceId,
    pub profile_tag_id: ProfileTagId,
    pub hour_of_sending: i32,
    pub days_cycle: Option<i32>,
    pub day_of_week_list: Vec<i32>,
    pub day_of_month_list: Vec<i32>,
    pub mail_subject: String,
    pub mail_content: String,
    pub sms_text: String,
    pub next_run_on: NaiveDate,
    pub end_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct CyclicRevivalUpdateDBRequest {
    pub hour_of_sending: Option<i32>,
    pub days_cycle: Option<i32>,
    pub day_of_week_list: Option<Vec<i32>>,
    pub day_of_month_list: Option<Vec<i32>>,
    pub mail_subject: Option<String>,
    pub mail_content: Option<String>,
    pub sms_text: Option<String>,
    pub next_run_on: Option<NaiveDate>,
    pub end_on: Option<NaiveDate>,
    pub is_active: Option<bool>,
}

/// A recurring mail/SMS campaign sent to every member of a profile tag
#[derive(Debug, Clone, FromRow)]
pub struct CyclicRevivalDBResponse {
    pub id: CyclicRevivalId,
    pub service_id: ServiceId,
    pub profile_tag_id: Option<ProfileTagId>,
    pub hour_of_sending: i32,
    pub days_cycle: Option<i32>,
    pub day_of_week_list: Vec<i32>,
    pub day_of_month_list: Vec<i32>,
    pub mail_subject: String,
    pub mail_content: String,
    pub sms_text: String,
    pub next_run_on: NaiveDate,
    pub end_on: Option<NaiveDate>,
    pub is_active: bool,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
}
