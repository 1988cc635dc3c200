//! Common type definitions and permission system types.
//!
//! This module defines:
//! - Type aliases for entity IDs (MemberId, ServiceId, etc.)
//! - Permission and authorization types
//! - Resource and operation enums for access control
//!
//! # Permission System
//!
//! Permissions are `(Resource, Operation)` pairs. They are granted to staff
//! through group permissions or per-member collaborator permissions, scoped to a
//! service. Operations come in two flavors:
//! - **All**: Unrestricted access to all entities of the service (e.g., `ReadAll`)
//! - **Own**: Restricted to the member's own entities (e.g., `ReadOwn`)
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

// Type aliases for IDs
pub type MemberId = Uuid;
pub type ServiceId = Uuid;
pub type GroupId = Uuid;
pub type ProductId = Uuid;
pub type SubscriptionId = Uuid;
pub type InvoiceId = Uuid;
pub type PaymentId = Uuid;
pub type PaymentMeanId = Uuid;
pub type TransactionId = Uuid;
pub type ProfileTagId = Uuid;
pub type RevivalId = Uuid;
pub type CyclicRevivalId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

// Common types for path parameters
#[derive(Debug, Clone, Deserialize)]
pub enum CurrentKeyword {
    #[serde(rename = "me")]
    Me,
}

/// Allows routes like /members/me and /members/{id} to hit the same handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MemberIdOrMe {
    Me(CurrentKeyword),
    Id(MemberId),
}

// Operations that can be performed on resources
// *-All means unrestricted access within the service, *-Own means restricted to own resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateAll,
    CreateOwn,
    ReadAll,
    ReadOwn,
    UpdateAll,
    UpdateOwn,
    DeleteAll,
    DeleteOwn,
}

// Resources that can be operated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Members,
    Groups,
    Services,
    Config,
    Products,
    Subscriptions,
    Invoices,
    Payments,
    PaymentMeans,
    ProfileTags,
    Revivals,
    Events,
}

// Permission types for authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    /// Simple permission: (Resource, Operation)
    Allow(Resource, Operation),
    /// Only the platform superuser qualifies
    Superuser,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateAll | Operation::CreateOwn => write!(f, "Create"),
            Operation::ReadAll | Operation::ReadOwn => write!(f, "Read"),
            Operation::UpdateAll | Operation::UpdateOwn => write!(f, "Update"),
            Operation::DeleteAll | Operation::DeleteOwn => write!(f, "Delete"),
        }
    }
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateAll => "create_all",
            Operation::CreateOwn => "create_own",
            Operation::ReadAll => "read_all",
            Operation::ReadOwn => "read_own",
            Operation::UpdateAll => "update_all",
            Operation::UpdateOwn => "update_own",
            Operation::DeleteAll => "delete_all",
            Operation::DeleteOwn => "delete_own",
        }
    }

    /// The *-Own counterpart of an *-All operation is implied by it.
    pub fn implies(&self, other: Operation) -> bool {
        if *self == other {
            return true;
        }
        matches!(
            (self, other),
            (Operation::CreateAll, Operation::CreateOwn)
                | (Operation::ReadAll, Operation::ReadOwn)
                | (Operation::UpdateAll, Operation::UpdateOwn)
                | (Operation::DeleteAll, Operation::DeleteOwn)
        )
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create_all" => Operation::CreateAll,
            "create_own" => Operation::CreateOwn,
            "read_all" => Operation::ReadAll,
            "read_own" => Operation::ReadOwn,
            "update_all" => Operation::UpdateAll,
            "update_own" => Operation::UpdateOwn,
            "delete_all" => Operation::DeleteAll,
            "delete_own" => Operation::DeleteOwn,
            other => return Err(format!("unknown operation '{other}'")),
        })
    }
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Members => "members",
            Resource::Groups => "groups",
            Resource::Services => "services",
            Resource::Config => "config",
            Resource::Products => "products",
            Resource::Subscriptions => "subscriptions",
            Resource::Invoices => "invoices",
            Resource::Payments => "payments",
            Resource::PaymentMeans => "payment_means",
            Resource::ProfileTags => "profile_tags",
            Resource::Revivals => "revivals",
            Resource::Events => "events",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "members" => Resource::Members,
            "groups" => Resource::Groups,
            "services" => Resource::Services,
            "config" => Resource::Config,
            "products" => Resource::Products,
            "subscriptions" => Resource::Subscriptions,
            "invoices" => Resource::Invoices,
            "payments" => Resource::Payments,
            "payment_means" => Resource::PaymentMeans,
            "profile_tags" => Resource::ProfileTags,
            "revivals" => Resource::Revivals,
            "events" => Resource::Events,
            other => return Err(format!("unknown resource '{other}'")),
        })
    }
}
