//! API request/response models for profile tags and revival campaigns.

use crate::billing::status::RevivalStatus;
use crate::db::models::revivals::{CyclicRevivalDBResponse, ProfileTagDBResponse, RevivalDBResponse};
use crate::types::{CyclicRevivalId, ProfileTagId, RevivalId, ServiceId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::pagination::Pagination;
use crate::db::handlers::repository::ListQuery;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProfileTagCreate {
    #[schema(example = "Football")]
    pub name: String,
    /// Reserved tags cannot be deleted
    #[serde(default)]
    pub is_reserved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProfileTagUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProfileTagResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ProfileTagId,
    pub name: String,
    pub slug: String,
    /// Members who declared this interest
    pub member_count: i32,
    pub is_active: bool,
    pub is_reserved: bool,
    /// Created from browsing rather than by staff
    pub is_auto: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ProfileTagDBResponse> for ProfileTagResponse {
    fn from(tag: ProfileTagDBResponse) -> Self {
        Self {
            id: tag.id,
            name: tag.name,
            slug: tag.slug,
            member_count: tag.member_count,
            is_active: tag.is_active,
            is_reserved: tag.is_reserved,
            is_auto: tag.is_auto,
            created_at: tag.created_at,
        }
    }
}

/// Query parameters for listing profile tags
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListProfileTagsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the tag name
    pub q: Option<String>,

    /// Include tags created automatically from browsing
    #[serde(default)]
    pub include_auto: bool,
}

impl ListProfileTagsQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// Tags attached to a billed or published object, matched against member interests by smart
/// revivals
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ObjectTagsRequest {
    /// Model of the object, e.g. `billing.Product`
    pub model_name: String,
    #[schema(value_type = String, format = "uuid")]
    pub object_id: Uuid,
    #[schema(value_type = Vec<String>)]
    pub tag_ids: Vec<ProfileTagId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevivalCreate {
    pub model_name: String,
    #[schema(value_type = String, format = "uuid")]
    pub object_id: Uuid,
    pub mail_subject: String,
    /// HTML body. `$client` is replaced by the member's first name.
    pub mail_content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RevivalUpdate {
    pub mail_subject: Option<String>,
    pub mail_content: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevivalResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: RevivalId,
    pub model_name: String,
    #[schema(value_type = String, format = "uuid")]
    pub object_id: Uuid,
    pub mail_subject: String,
    pub mail_content: String,
    pub status: RevivalStatus,
    /// Mails sent so far
    pub progress: i32,
    /// Targets at the first run
    pub total: i32,
    pub run_on: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<RevivalDBResponse> for RevivalResponse {
    fn from(revival: RevivalDBResponse) -> Self {
        Self {
            id: revival.id,
            model_name: revival.model_name,
            object_id: revival.object_id,
            mail_subject: revival.mail_subject,
            mail_content: revival.mail_content,
            status: revival.status,
            progress: revival.progress,
            total: revival.total,
            run_on: revival.run_on,
            is_active: revival.is_active,
            created_at: revival.created_at,
        }
    }
}

/// Query parameters for listing smart revivals
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListRevivalsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on the mail subject
    pub q: Option<String>,

    pub status: Option<RevivalStatus>,
}

impl ListRevivalsQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// A recurring campaign. Exactly one of `days_cycle`, `day_of_week_list` and
/// `day_of_month_list` sets the recurrence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CyclicRevivalCreate {
    #[schema(value_type = String, format = "uuid")]
    pub profile_tag_id: ProfileTagId,
    /// Hour of the day (UTC) the campaign is sent
    pub hour_of_sending: i32,
    pub days_cycle: Option<i32>,
    /// ISO weekdays, 1 is Monday
    #[serde(default)]
    pub day_of_week_list: Vec<i32>,
    #[serde(default)]
    pub day_of_month_list: Vec<i32>,
    pub mail_subject: String,
    pub mail_content: String,
    #[serde(default)]
    pub sms_text: String,
    pub next_run_on: NaiveDate,
    pub end_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CyclicRevivalUpdate {
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

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CyclicRevivalResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: CyclicRevivalId,
    #[schema(value_type = String, format = "uuid")]
    pub service_id: ServiceId,
    #[schema(value_type = Option<String>, format = "uuid")]
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
    pub created_at: DateTime<Utc>,
}

impl From<CyclicRevivalDBResponse> for CyclicRevivalResponse {
    fn from(revival: CyclicRevivalDBResponse) -> Self {
        Self {
            id: revival.id,
            service_id: revival.service_id,
            profile_tag_id: revival.profile_tag_id,
            hour_of_sending: revival.hour_of_sending,
            days_cycle: revival.days_cycle,
            day_of_week_list: revival.day_of_week_list,
            day_of_month_list: revival.day_of_month_list,
            mail_subject: revival.mail_subject,
            mail_content: revival.mail_content,
            sms_text: revival.sms_text,
            next_run_on: revival.next_run_on,
            end_on: revival.end_on,
            is_active: revival.is_active,
            created_at: revival.created_at,
        }
    }
}
