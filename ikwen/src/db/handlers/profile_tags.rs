//! Database repository for profile tags and the member/object profiles that reference them.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::revivals::{ProfileTagCreateDBRequest, ProfileTagDBResponse, ProfileTagUpdateDBRequest},
};
use crate::types::{MemberId, Operation, ProfileTagId, ServiceId, abbrev_uuid};
use sqlx::{Connection, PgConnection};
use tracing::instrument;
use uuid::Uuid;

const TAG_COLUMNS: &str = "id, service_id, name, slug, member_count, is_active, is_reserved, is_auto, created_at";

#[derive(Debug, Clone)]
pub struct ProfileTagFilter {
    pub service_id: ServiceId,
    /// Hide tags created automatically from browsing
    pub exclude_auto: bool,
    pub query: ListQuery,
}

pub struct ProfileTags<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for ProfileTags<'c> {
    type CreateRequest = ProfileTagCreateDBRequest;
    type UpdateRequest = ProfileTagUpdateDBRequest;
    type Response = ProfileTagDBResponse;
    type Id = ProfileTagId;
    type Filter = ProfileTagFilter;

    #[instrument(skip(self, request), fields(slug = %request.slug), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let tag = sqlx::query_as::<_, ProfileTagDBResponse>(&format!(
            r#"
            INSERT INTO profile_tags (id, service_id, name, slug, is_reserved, is_auto)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TAG_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(&request.name)
        .bind(&request.slug)
        .bind(request.is_reserved)
        .bind(request.is_auto)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(tag)
    }

    #[instrument(skip(self), fields(tag_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let tag = sqlx::query_as::<_, ProfileTagDBResponse>(&format!("SELECT {TAG_COLUMNS} FROM profile_tags WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(tag)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let tags = sqlx::query_as::<_, ProfileTagDBResponse>(&format!("SELECT {TAG_COLUMNS} FROM profile_tags WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(tags.into_iter().map(|t| (t.id, t)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let tags = sqlx::query_as::<_, ProfileTagDBResponse>(&format!(
            r#"
            SELECT {TAG_COLUMNS} FROM profile_tags
            WHERE service_id = $1 AND (NOT $2 OR NOT is_auto) AND ($3::text IS NULL OR LOWER(name) LIKE $3)
            ORDER BY name
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.exclude_auto)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(tags)
    }

    #[instrument(skip(self), fields(tag_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let Some(tag) = self.get_by_id(id).await? else {
            return Ok(false);
        };
        if tag.is_reserved {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: "reserved profile tags cannot be deleted".to_string(),
                entity_type: "ProfileTag".to_string(),
                entity_id: Some(id.to_string()),
            });
        }
        let result = sqlx::query("DELETE FROM profile_tags WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(tag_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let tag = sqlx::query_as::<_, ProfileTagDBResponse>(&format!(
            r#"
            UPDATE profile_tags SET
                name = COALESCE($2, name),
                is_active = COALESCE($3, is_active)
            WHERE id = $1
            RETURNING {TAG_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(tag)
    }
}

impl<'c> ProfileTags<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &ProfileTagFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM profile_tags WHERE service_id = $1 AND (NOT $2 OR NOT is_auto) AND ($3::text IS NULL OR LOWER(name) LIKE $3)",
        )
        .bind(filter.service_id)
        .bind(filter.exclude_auto)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get_by_slug(&mut self, service_id: ServiceId, slug: &str) -> Result<Option<ProfileTagDBResponse>> {
        let tag = sqlx::query_as::<_, ProfileTagDBResponse>(&format!(
            "SELECT {TAG_COLUMNS} FROM profile_tags WHERE service_id = $1 AND slug = $2"
        ))
        .bind(service_id)
        .bind(slug)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(tag)
    }

    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn member_tags(&mut self, service_id: ServiceId, member_id: MemberId) -> Result<Vec<ProfileTagDBResponse>> {
        let tags = sqlx::query_as::<_, ProfileTagDBResponse>(
            r#"
            SELECT t.id, t.service_id, t.name, t.slug, t.member_count, t.is_active, t.is_reserved, t.is_auto, t.created_at
            FROM profile_tags t
            JOIN member_profiles mp ON mp.tag_id = t.id
            WHERE mp.member_id = $1 AND mp.service_id = $2
            ORDER BY t.name
            "#,
        )
        .bind(member_id)
        .bind(service_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(tags)
    }

    #[instrument(skip(self), fields(object_id = %abbrev_uuid(&object_id)), err)]
    pub async fn object_tag_ids(&mut self, model_name: &str, object_id: Uuid) -> Result<Vec<ProfileTagId>> {
        let ids: Vec<ProfileTagId> = sqlx::query_scalar("SELECT tag_id FROM object_profiles WHERE model_name = $1 AND object_id = $2")
            .bind(model_name)
            .bind(object_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(ids)
    }

    /// Replace the profile tags of a member within a service and refresh the affected counts
    #[instrument(skip(self, tag_ids), fields(member_id = %abbrev_uuid(&member_id), count = tag_ids.len()), err)]
    pub async fn set_member_tags(&mut self, service_id: ServiceId, member_id: MemberId, tag_ids: &[ProfileTagId]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM member_profiles WHERE member_id = $1 AND service_id = $2")
            .bind(member_id)
            .bind(service_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO member_profiles (member_id, service_id, tag_id)
            SELECT $1, $2, t.id FROM profile_tags t WHERE t.id = ANY($3) AND t.service_id = $2
            "#,
        )
        .bind(member_id)
        .bind(service_id)
        .bind(tag_ids)
        .execute(&mut *tx)
        .await?;

        refresh_counts(&mut tx, service_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the profile tags of a billed or published object
    #[instrument(skip(self, tag_ids), fields(object_id = %abbrev_uuid(&object_id), count = tag_ids.len()), err)]
    pub async fn set_object_tags(&mut self, service_id: ServiceId, model_name: &str, object_id: Uuid, tag_ids: &[ProfileTagId]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM object_profiles WHERE model_name = $1 AND object_id = $2")
            .bind(model_name)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO object_profiles (service_id, model_name, object_id, tag_id)
            SELECT $1, $2, $3, t.id FROM profile_tags t WHERE t.id = ANY($4) AND t.service_id = $1
            "#,
        )
        .bind(service_id)
        .bind(model_name)
        .bind(object_id)
        .bind(tag_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Recompute `member_count` of every tag of a service from the join rows
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn refresh_member_counts(&mut self, service_id: ServiceId) -> Result<()> {
        refresh_counts(&mut *self.db, service_id).await
    }
}

async fn refresh_counts(db: &mut PgConnection, service_id: ServiceId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE profile_tags t SET member_count = (
            SELECT COUNT(*) FROM member_profiles mp
            JOIN members m ON m.id = mp.member_id
            WHERE mp.tag_id = t.id AND m.is_active
        )
        WHERE t.service_id = $1
        "#,
    )
    .bind(service_id)
    .execute(&mut *db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_member, create_test_service};
    use sqlx::PgPool;

    fn tag(service_id: ServiceId, name: &str, is_reserved: bool) -> ProfileTagCreateDBRequest {
        ProfileTagCreateDBRequest {
            service_id,
            name: name.to_string(),
            slug: name.to_lowercase(),
            is_reserved,
            is_auto: false,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_member_tags_refresh_counts(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let fan = create_test_member(&pool, "fan").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = ProfileTags::new(&mut conn);

        let shoes = repo.create(&tag(service.id, "Shoes", false)).await.unwrap();
        let bags = repo.create(&tag(service.id, "Bags", false)).await.unwrap();

        repo.set_member_tags(service.id, fan.id, &[shoes.id, bags.id]).await.unwrap();
        repo.set_member_tags(service.id, owner.id, &[shoes.id]).await.unwrap();
        assert_eq!(repo.get_by_id(shoes.id).await.unwrap().unwrap().member_count, 2);
        assert_eq!(repo.get_by_id(bags.id).await.unwrap().unwrap().member_count, 1);

        repo.set_member_tags(service.id, fan.id, &[]).await.unwrap();
        assert_eq!(repo.get_by_id(bags.id).await.unwrap().unwrap().member_count, 0);
        assert_eq!(repo.member_tags(service.id, owner.id).await.unwrap().len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reserved_tag_is_protected(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = ProfileTags::new(&mut conn);

        let reserved = repo.create(&tag(service.id, "Customers", true)).await.unwrap();
        assert!(matches!(repo.delete(reserved.id).await, Err(DbError::ProtectedEntity { .. })));

        let plain = repo.create(&tag(service.id, "Promo", false)).await.unwrap();
        assert!(repo.delete(plain.id).await.unwrap());
    }
}
