//! Permission checks and the `RequiresPermission` extractor.
//!
//! The current member's access to the current tenant is resolved once, when [`CurrentUser`] is
//! extracted, so every check here is synchronous:
//! - a superuser can do everything, in every tenant
//! - the owner of the tenant and its `Sudo` staff can do everything inside it
//! - other members hold the union of their group and collaborator grants
//!
//! A grant of an *-All operation implies its *-Own counterpart.

use std::marker::PhantomData;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    AppState,
    api::models::members::{CurrentUser, TenantAccess},
    errors::Error,
    types::{MemberId, Operation, Permission, Resource},
};

/// Type-level resources for [`RequiresPermission`]
pub mod resource {
    use crate::types::Resource;

    pub trait ResourceType {
        const RESOURCE: Resource;
    }

    macro_rules! resources {
        ($($name:ident),* $(,)?) => {
            $(
                pub struct $name;
                impl ResourceType for $name {
                    const RESOURCE: Resource = Resource::$name;
                }
            )*
        };
    }

    resources!(
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
    );
}

/// Type-level operations for [`RequiresPermission`]
pub mod operation {
    use crate::types::Operation;

    pub trait OperationType {
        const OPERATION: Operation;
    }

    macro_rules! operations {
        ($($name:ident),* $(,)?) => {
            $(
                pub struct $name;
                impl OperationType for $name {
                    const OPERATION: Operation = Operation::$name;
                }
            )*
        };
    }

    operations!(CreateAll, CreateOwn, ReadAll, ReadOwn, UpdateAll, UpdateOwn, DeleteAll, DeleteOwn);
}

/// Whether the member may perform `operation` on `resource` in the current tenant
pub fn has_permission(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    if user.is_superuser {
        return true;
    }
    match &user.access {
        TenantAccess::Full => true,
        TenantAccess::Granted(grants) => grants.iter().any(|(r, op)| *r == resource && op.implies(operation)),
        TenantAccess::Outsider => false,
    }
}

pub fn can_read_all_resources(user: &CurrentUser, resource: Resource) -> bool {
    has_permission(user, resource, Operation::ReadAll)
}

/// Members can always read and update their own profile
pub fn can_manage_member(user: &CurrentUser, member_id: MemberId, operation: Operation) -> bool {
    if user.id == member_id && matches!(operation, Operation::ReadOwn | Operation::UpdateOwn | Operation::ReadAll | Operation::UpdateAll) {
        return true;
    }
    let all = match operation {
        Operation::CreateOwn | Operation::CreateAll => Operation::CreateAll,
        Operation::ReadOwn | Operation::ReadAll => Operation::ReadAll,
        Operation::UpdateOwn | Operation::UpdateAll => Operation::UpdateAll,
        Operation::DeleteOwn | Operation::DeleteAll => Operation::DeleteAll,
    };
    has_permission(user, Resource::Members, all)
}

/// Fail with `InsufficientPermissions` unless [`has_permission`] holds
pub fn require(user: &CurrentUser, resource: Resource, operation: Operation) -> Result<(), Error> {
    if has_permission(user, resource, operation) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: Permission::Allow(resource, operation),
            action: operation,
            resource: resource.to_string(),
        })
    }
}

/// Extractor that authenticates the member and checks one permission on the current tenant.
pub struct RequiresPermission<R, O> {
    pub user: CurrentUser,
    _marker: PhantomData<(R, O)>,
}

impl<R, O> std::ops::Deref for RequiresPermission<R, O> {
    type Target = CurrentUser;

    fn deref(&self) -> &Self::Target {
        &self.user
    }
}

impl<R, O> FromRequestParts<AppState> for RequiresPermission<R, O>
where
    R: resource::ResourceType + Send + Sync,
    O: operation::OperationType + Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        require(&user, R::RESOURCE, O::OPERATION)?;
        Ok(Self {
            user,
            _marker: PhantomData,
        })
    }
}

/// Extractor for platform administration endpoints
pub struct RequiresSuperuser(pub CurrentUser);

impl FromRequestParts<AppState> for RequiresSuperuser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_superuser {
            return Err(Error::InsufficientPermissions {
                required: Permission::Superuser,
                action: Operation::UpdateAll,
                resource: "the platform".to_string(),
            });
        }
        Ok(Self(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user(access: TenantAccess) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            username: "staff".to_string(),
            email: None,
            first_name: "Staff".to_string(),
            full_name: "Staff Member".to_string(),
            is_superuser: false,
            is_staff: true,
            is_iao: false,
            service_id: Some(Uuid::new_v4()),
            access,
        }
    }

    #[test]
    fn test_full_access_allows_everything() {
        let owner = user(TenantAccess::Full);
        assert!(has_permission(&owner, Resource::Invoices, Operation::DeleteAll));
        assert!(has_permission(&owner, Resource::Config, Operation::UpdateAll));
    }

    #[test]
    fn test_superuser_without_tenant_access() {
        let mut admin = user(TenantAccess::Outsider);
        admin.is_superuser = true;
        assert!(has_permission(&admin, Resource::Services, Operation::CreateAll));
    }

    #[test]
    fn test_grants_and_implied_own_operations() {
        let staff = user(TenantAccess::Granted(vec![
            (Resource::Products, Operation::ReadAll),
            (Resource::Invoices, Operation::UpdateOwn),
        ]));
        assert!(has_permission(&staff, Resource::Products, Operation::ReadAll));
        assert!(has_permission(&staff, Resource::Products, Operation::ReadOwn));
        assert!(!has_permission(&staff, Resource::Products, Operation::UpdateAll));
        assert!(has_permission(&staff, Resource::Invoices, Operation::UpdateOwn));
        assert!(!has_permission(&staff, Resource::Invoices, Operation::UpdateAll));
        assert!(!has_permission(&staff, Resource::Groups, Operation::ReadOwn));
    }

    #[test]
    fn test_members_manage_their_own_profile() {
        let member = user(TenantAccess::Granted(vec![]));
        assert!(can_manage_member(&member, member.id, Operation::ReadOwn));
        assert!(can_manage_member(&member, member.id, Operation::UpdateOwn));
        assert!(!can_manage_member(&member, member.id, Operation::DeleteOwn));
        assert!(!can_manage_member(&member, Uuid::new_v4(), Operation::ReadAll));

        let outsider = user(TenantAccess::Outsider);
        assert!(can_manage_member(&outsider, outsider.id, Operation::UpdateOwn));
    }

    #[test]
    fn test_require_reports_the_missing_permission() {
        let member = user(TenantAccess::Granted(vec![]));
        let err = require(&member, Resource::Revivals, Operation::CreateAll).unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
        assert!(require(&member, Resource::Revivals, Operation::CreateAll).is_err());
    }
}
