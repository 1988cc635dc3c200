//! API request/response models for groups.

use crate::db::models::groups::GroupDBResponse;
use crate::types::{GroupId, Operation, Resource, ServiceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for creating a new group in the current service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GroupCreate {
    /// Display name, unique within the service
    #[schema(example = "Cashiers")]
    pub name: String,
}

/// Request body for renaming a group. `Sudo` and `Community` cannot be renamed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GroupUpdate {
    #[schema(example = "Senior cashiers")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GroupResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: GroupId,
    #[schema(value_type = String, format = "uuid")]
    pub service_id: ServiceId,
    pub name: String,
    /// Reserved groups are created with the service and cannot be deleted
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
}

impl From<GroupDBResponse> for GroupResponse {
    fn from(group: GroupDBResponse) -> Self {
        Self {
            reserved: group.is_reserved(),
            id: group.id,
            service_id: group.service_id,
            name: group.name,
            created_at: group.created_at,
        }
    }
}

/// One `(resource, operation)` grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PermissionGrant {
    pub resource: Resource,
    pub operation: Operation,
}

impl From<(Resource, Operation)> for PermissionGrant {
    fn from((resource, operation): (Resource, Operation)) -> Self {
        Self { resource, operation }
    }
}

/// A complete permission set. Setting it replaces the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PermissionSet {
    pub permissions: Vec<PermissionGrant>,
}

impl PermissionSet {
    pub fn pairs(&self) -> Vec<(Resource, Operation)> {
        self.permissions.iter().map(|p| (p.resource, p.operation)).collect()
    }
}

impl From<Vec<(Resource, Operation)>> for PermissionSet {
    fn from(pairs: Vec<(Resource, Operation)>) -> Self {
        Self {
            permissions: pairs.into_iter().map(PermissionGrant::from).collect(),
        }
    }
}
