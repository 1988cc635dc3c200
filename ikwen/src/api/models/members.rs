//! API request/response models for members.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::db::handlers::repository::ListQuery;
use crate::db::models::members::MemberDBResponse;
use crate::errors::Error;
use crate::types::{MemberId, Operation, Resource, ServiceId};

/// What the current member may do in the current tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantAccess {
    /// Owner of the service or member of its `Sudo` group
    Full,
    /// Union of group and collaborator grants
    Granted(Vec<(Resource, Operation)>),
    /// No tenant was resolved for the request
    Outsider,
}

/// The authenticated member, with their access to the tenant named by the request
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: MemberId,
    pub username: String,
    pub email: Option<String>,
    pub first_name: String,
    pub full_name: String,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_iao: bool,
    pub service_id: Option<ServiceId>,
    pub access: TenantAccess,
}

impl CurrentUser {
    /// The tenant of the request, required by every tenant-scoped endpoint
    pub fn tenant(&self) -> Result<ServiceId, Error> {
        self.service_id.ok_or_else(|| Error::BadRequest {
            message: "No service selected: send the X-Ikwen-Service header".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MemberResponse {
    #[schema(value_type = String, format = "uuid")]
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
    pub is_staff: bool,
    pub is_superuser: bool,
    pub is_active: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<MemberDBResponse> for MemberResponse {
    fn from(member: MemberDBResponse) -> Self {
        // Placeholder addresses stay internal
        let email = member.deliverable_email().map(str::to_string);
        Self {
            id: member.id,
            username: member.username,
            email,
            phone: member.phone,
            first_name: member.first_name,
            last_name: member.last_name,
            full_name: member.full_name,
            gender: member.gender,
            dob: member.dob,
            language: member.language,
            is_staff: member.is_staff,
            is_superuser: member.is_superuser,
            is_active: member.is_active,
            date_joined: member.date_joined,
            last_login: member.last_login,
        }
    }
}

/// Profile fields a member can change on their own account
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MemberUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub gender: Option<String>,
    pub language: Option<String>,
}

/// Query parameters for the community listing
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListMembersQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Search on name, username and email
    pub q: Option<String>,
}

impl ListMembersQuery {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// Target group of a member move
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MoveToGroupRequest {
    #[schema(value_type = String, format = "uuid")]
    pub group_id: uuid::Uuid,
}

/// Profile tags a member declares interest in
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MemberTagsRequest {
    #[schema(value_type = Vec<String>)]
    pub tag_ids: Vec<uuid::Uuid>,
}
