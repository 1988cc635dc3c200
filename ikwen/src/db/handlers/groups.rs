//! Database repository for groups, group membership and permission grants.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::groups::{
        COMMUNITY_GROUP, GroupCreateDBRequest, GroupDBResponse, GroupUpdateDBRequest, MemberPermissionGrant, PermissionRow,
        SUDO_GROUP, is_reserved_group,
    },
};
use crate::types::{GroupId, MemberId, Operation, Resource, ServiceId, abbrev_uuid};
use sqlx::{Connection, PgConnection};
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing groups of a service
#[derive(Debug, Clone)]
pub struct GroupFilter {
    pub service_id: ServiceId,
    pub query: ListQuery,
}

pub struct Groups<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Groups<'c> {
    type CreateRequest = GroupCreateDBRequest;
    type UpdateRequest = GroupUpdateDBRequest;
    type Response = GroupDBResponse;
    type Id = GroupId;
    type Filter = GroupFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let group = sqlx::query_as::<_, GroupDBResponse>(
            "INSERT INTO groups (id, service_id, name) VALUES ($1, $2, $3) RETURNING id, service_id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(request.name.trim())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(group)
    }

    #[instrument(skip(self), fields(group_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let group = sqlx::query_as::<_, GroupDBResponse>("SELECT id, service_id, name, created_at FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(group)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let groups =
            sqlx::query_as::<_, GroupDBResponse>("SELECT id, service_id, name, created_at FROM groups WHERE id = ANY($1)")
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(groups.into_iter().map(|g| (g.id, g)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let groups = sqlx::query_as::<_, GroupDBResponse>(
            r#"
            SELECT id, service_id, name, created_at FROM groups
            WHERE service_id = $1 AND ($2::text IS NULL OR LOWER(name) LIKE $2)
            ORDER BY created_at ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.service_id)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(groups)
    }

    #[instrument(skip(self), fields(group_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let Some(group) = self.get_by_id(id).await? else {
            return Ok(false);
        };
        if group.is_reserved() {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: format!("{} is a reserved group", group.name),
                entity_type: "group".to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(group_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let group = self.get_by_id(id).await?.ok_or(DbError::NotFound)?;
        if let Some(name) = &request.name
            && name.trim() != group.name
            && (group.is_reserved() || is_reserved_group(name.trim()))
        {
            return Err(DbError::ProtectedEntity {
                operation: Operation::UpdateAll,
                reason: "reserved groups cannot be renamed and their names cannot be reused".to_string(),
                entity_type: "group".to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let group = sqlx::query_as::<_, GroupDBResponse>(
            "UPDATE groups SET name = COALESCE($2, name) WHERE id = $1 RETURNING id, service_id, name, created_at",
        )
        .bind(id)
        .bind(request.name.as_deref().map(str::trim))
        .fetch_one(&mut *self.db)
        .await?;
        Ok(group)
    }
}

impl<'c> Groups<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self, service_id: ServiceId, query: &ListQuery) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM groups WHERE service_id = $1 AND ($2::text IS NULL OR LOWER(name) LIKE $2)")
                .bind(service_id)
                .bind(query.search_pattern())
                .fetch_one(&mut *self.db)
                .await?;
        Ok(count)
    }

    /// Create the `Sudo` and `Community` groups of a new service
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn create_reserved(&mut self, service_id: ServiceId) -> Result<()> {
        for name in [SUDO_GROUP, COMMUNITY_GROUP] {
            sqlx::query("INSERT INTO groups (id, service_id, name) VALUES ($1, $2, $3) ON CONFLICT (service_id, name) DO NOTHING")
                .bind(Uuid::new_v4())
                .bind(service_id)
                .bind(name)
                .execute(&mut *self.db)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_name(&mut self, service_id: ServiceId, name: &str) -> Result<Option<GroupDBResponse>> {
        let group = sqlx::query_as::<_, GroupDBResponse>(
            "SELECT id, service_id, name, created_at FROM groups WHERE service_id = $1 AND name = $2",
        )
        .bind(service_id)
        .bind(name)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(group)
    }

    /// Add a member to a group. Returns false when they already belonged to it.
    #[instrument(skip(self), fields(group_id = %abbrev_uuid(&group_id), member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn add_member(&mut self, group_id: GroupId, member_id: MemberId) -> Result<bool> {
        let result = sqlx::query("INSERT INTO group_members (group_id, member_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(group_id)
            .bind(member_id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Add a member to a service's group by name
    #[instrument(skip(self), err)]
    pub async fn add_member_to_named(&mut self, service_id: ServiceId, name: &str, member_id: MemberId) -> Result<bool> {
        let group = self.get_by_name(service_id, name).await?.ok_or(DbError::NotFound)?;
        self.add_member(group.id, member_id).await
    }

    /// Groups of a service the member belongs to
    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn member_groups(&mut self, service_id: ServiceId, member_id: MemberId) -> Result<Vec<GroupDBResponse>> {
        let groups = sqlx::query_as::<_, GroupDBResponse>(
            r#"
            SELECT g.id, g.service_id, g.name, g.created_at FROM groups g
            JOIN group_members gm ON gm.group_id = g.id
            WHERE g.service_id = $1 AND gm.member_id = $2
            ORDER BY g.name
            "#,
        )
        .bind(service_id)
        .bind(member_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(groups)
    }

    /// Remove a member from every other group of the service and add them to `group_id`
    #[instrument(skip(self), fields(group_id = %abbrev_uuid(&group_id), member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn move_member(&mut self, group_id: GroupId, member_id: MemberId) -> Result<GroupDBResponse> {
        let mut tx = self.db.begin().await?;

        let group = sqlx::query_as::<_, GroupDBResponse>("SELECT id, service_id, name, created_at FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

        sqlx::query(
            "DELETE FROM group_members WHERE member_id = $1 AND group_id IN (SELECT id FROM groups WHERE service_id = $2 AND id <> $3)",
        )
        .bind(member_id)
        .bind(group.service_id)
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO group_members (group_id, member_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(group_id)
            .bind(member_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(group)
    }

    #[instrument(skip(self), fields(group_id = %abbrev_uuid(&group_id)), err)]
    pub async fn get_permissions(&mut self, group_id: GroupId) -> Result<Vec<(Resource, Operation)>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            "SELECT resource, operation FROM group_permissions WHERE group_id = $1 ORDER BY resource, operation",
        )
        .bind(group_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows.iter().filter_map(PermissionRow::parse).collect())
    }

    /// Replace a group's permission set
    #[instrument(skip(self, permissions), fields(group_id = %abbrev_uuid(&group_id), count = permissions.len()), err)]
    pub async fn set_permissions(&mut self, group_id: GroupId, permissions: &[(Resource, Operation)]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM group_permissions WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for (resource, operation) in permissions {
            sqlx::query("INSERT INTO group_permissions (group_id, resource, operation) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING")
                .bind(group_id)
                .bind(resource.as_str())
                .bind(operation.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Collaborator permissions granted directly to a member
    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn get_member_permissions(&mut self, service_id: ServiceId, member_id: MemberId) -> Result<Vec<(Resource, Operation)>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            "SELECT resource, operation FROM member_permissions WHERE service_id = $1 AND member_id = $2 ORDER BY resource, operation",
        )
        .bind(service_id)
        .bind(member_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows.iter().filter_map(PermissionRow::parse).collect())
    }

    /// Replace a member's collaborator permissions
    #[instrument(skip(self, grant), fields(member_id = %abbrev_uuid(&grant.member_id), count = grant.permissions.len()), err)]
    pub async fn set_member_permissions(&mut self, grant: &MemberPermissionGrant) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM member_permissions WHERE service_id = $1 AND member_id = $2")
            .bind(grant.service_id)
            .bind(grant.member_id)
            .execute(&mut *tx)
            .await?;
        for (resource, operation) in &grant.permissions {
            sqlx::query(
                "INSERT INTO member_permissions (member_id, service_id, resource, operation) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            )
            .bind(grant.member_id)
            .bind(grant.service_id)
            .bind(resource.as_str())
            .bind(operation.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Union of a member's group permissions and collaborator permissions within a service
    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn effective_permissions(&mut self, service_id: ServiceId, member_id: MemberId) -> Result<Vec<(Resource, Operation)>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT gp.resource, gp.operation FROM group_permissions gp
            JOIN groups g ON g.id = gp.group_id
            JOIN group_members gm ON gm.group_id = g.id
            WHERE g.service_id = $1 AND gm.member_id = $2
            UNION
            SELECT resource, operation FROM member_permissions WHERE service_id = $1 AND member_id = $2
            "#,
        )
        .bind(service_id)
        .bind(member_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows.iter().filter_map(PermissionRow::parse).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_member, create_test_service};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_reserved_groups_are_protected(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Groups::new(&mut conn);
        let sudo = repo.get_by_name(service.id, SUDO_GROUP).await.unwrap().unwrap();

        let err = repo.delete(sudo.id).await.unwrap_err();
        assert!(matches!(err, DbError::ProtectedEntity { .. }));

        let err = repo
            .update(
                sudo.id,
                &GroupUpdateDBRequest {
                    name: Some("Admins".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ProtectedEntity { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_move_member_leaves_other_groups(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let member = create_test_member(&pool, "cashier").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Groups::new(&mut conn);
        repo.add_member_to_named(service.id, COMMUNITY_GROUP, member.id).await.unwrap();
        let cashiers = repo
            .create(&GroupCreateDBRequest {
                service_id: service.id,
                name: "Cashiers".into(),
            })
            .await
            .unwrap();

        repo.move_member(cashiers.id, member.id).await.unwrap();

        let groups = repo.member_groups(service.id, member.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Cashiers");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_effective_permissions_union(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let member = create_test_member(&pool, "staff").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Groups::new(&mut conn);
        let group = repo
            .create(&GroupCreateDBRequest {
                service_id: service.id,
                name: "Billing".into(),
            })
            .await
            .unwrap();
        repo.add_member(group.id, member.id).await.unwrap();
        repo.set_permissions(group.id, &[(Resource::Invoices, Operation::ReadAll)])
            .await
            .unwrap();
        repo.set_member_permissions(&MemberPermissionGrant {
            member_id: member.id,
            service_id: service.id,
            permissions: vec![(Resource::Payments, Operation::CreateAll), (Resource::Invoices, Operation::ReadAll)],
        })
        .await
        .unwrap();

        let mut permissions = repo.effective_permissions(service.id, member.id).await.unwrap();
        permissions.sort_by_key(|(r, o)| (r.as_str(), o.as_str()));
        assert_eq!(
            permissions,
            vec![(Resource::Invoices, Operation::ReadAll), (Resource::Payments, Operation::CreateAll)]
        );
    }
}
