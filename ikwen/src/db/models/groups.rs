//! Database models for groups and permission grants.

use crate::types::{GroupId, MemberId, Operation, Resource, ServiceId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Staff with every permission inside the service
pub const SUDO_GROUP: &str = "Sudo";
/// Every registered member of the service
pub const COMMUNITY_GROUP: &str = "Community";

pub fn is_reserved_group(name: &str) -> bool {
    name == SUDO_GROUP || name == COMMUNITY_GROUP
}

/// Database request for creating a new group
#[derive(Debug, Clone)]
pub struct GroupCreateDBRequest {
    pub service_id: ServiceId,
    pub name: String,
}

/// Database request for updating a group
#[derive(Debug, Clone, Default)]
pub struct GroupUpdateDBRequest {
    pub name: Option<String>,
}

/// Database response for a group
#[derive(Debug, Clone, FromRow)]
pub struct GroupDBResponse {
    pub id: GroupId,
    pub service_id: ServiceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl GroupDBResponse {
    pub fn is_reserved(&self) -> bool {
        is_reserved_group(&self.name)
    }
}

/// A `(resource, operation)` grant as stored in `group_permissions` and `member_permissions`
#[derive(Debug, Clone, FromRow)]
pub struct PermissionRow {
    pub resource: String,
    pub operation: String,
}

impl PermissionRow {
    /// Rows that no longer parse (removed resources) are skipped
    pub fn parse(&self) -> Option<(Resource, Operation)> {
        Some((self.resource.parse().ok()?, self.operation.parse().ok()?))
    }
}

/// Collaborator grant for one member in one service
#[derive(Debug, Clone)]
pub struct MemberPermissionGrant {
    pub member_id: MemberId,
    pub service_id: ServiceId,
    pub permissions: Vec<(Resource, Operation)>,
}
