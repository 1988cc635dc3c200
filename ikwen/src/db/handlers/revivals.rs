//! Database repository for smart revivals and their targets.

use std::collections::HashMap;

use crate::billing::status::{RevivalStatus, StatusMachine};
use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::revivals::{RevivalCreateDBRequest, RevivalDBResponse, RevivalUpdateDBRequest, TargetDBResponse},
};
use crate::errors::Error;
use crate::types::{MemberId, RevivalId, ServiceId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const REVIVAL_COLUMNS: &str = "id, service_id, model_name, object_id, mail_subject, mail_content, status, progress, total, run_on, \
     is_active, is_running, created_at";

const TARGET_COLUMNS: &str = "t.revival_id, t.member_id, t.revival_count, t.notified, t.created_at, \
     m.email, m.phone, m.first_name, COALESCE(m.language, 'en') AS language";

/// Members with a real address whose profile tags intersect the revival object's tags
const MATCHING_MEMBERS: &str = r#"
    SELECT m.id, m.date_joined FROM members m
    WHERE m.is_active AND NOT m.is_ghost
      AND m.email IS NOT NULL AND m.email NOT LIKE '\_\_%\_\_@ikwen.com'
      AND EXISTS (
          SELECT 1 FROM member_profiles mp
          JOIN object_profiles op ON op.tag_id = mp.tag_id
          WHERE mp.member_id = m.id AND op.model_name = $2 AND op.object_id = $3
      )
      AND ($4::timestamptz IS NULL OR m.date_joined > $4)
    ORDER BY m.date_joined, m.id
    LIMIT $5 OFFSET $6
"#;

#[derive(Debug, Clone)]
pub struct RevivalFilter {
    pub service_id: ServiceId,
    pub status: Option<RevivalStatus>,
    pub query: ListQuery,
}

/// Outcome of one chunk of target building
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetChunk {
    /// Members matched in the chunk
    pub scanned: i64,
    /// Targets actually created, members already targeted are skipped
    pub inserted: i64,
}

pub struct Revivals<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Revivals<'c> {
    type CreateRequest = RevivalCreateDBRequest;
    type UpdateRequest = RevivalUpdateDBRequest;
    type Response = RevivalDBResponse;
    type Id = RevivalId;
    type Filter = RevivalFilter;

    #[instrument(skip(self, request), fields(object_id = %abbrev_uuid(&request.object_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let revival = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            r#"
            INSERT INTO revivals (id, service_id, model_name, object_id, mail_subject, mail_content)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {REVIVAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(&request.model_name)
        .bind(request.object_id)
        .bind(&request.mail_subject)
        .bind(&request.mail_content)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(revival)
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let revival = sqlx::query_as::<_, RevivalDBResponse>(&format!("SELECT {REVIVAL_COLUMNS} FROM revivals WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(revival)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let revivals = sqlx::query_as::<_, RevivalDBResponse>(&format!("SELECT {REVIVAL_COLUMNS} FROM revivals WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(revivals.into_iter().map(|r| (r.id, r)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let revivals = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            r#"
            SELECT {REVIVAL_COLUMNS} FROM revivals
            WHERE service_id = $1
              AND ($2::revival_status IS NULL OR status = $2)
              AND ($3::text IS NULL OR LOWER(mail_subject) LIKE $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(revivals)
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM revivals WHERE id = $1 AND NOT is_running")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(revival_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let revival = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            r#"
            UPDATE revivals SET
                mail_subject = COALESCE($2, mail_subject),
                mail_content = COALESCE($3, mail_content),
                is_active = COALESCE($4, is_active)
            WHERE id = $1
            RETURNING {REVIVAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.mail_subject)
        .bind(&request.mail_content)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(revival)
    }
}

impl<'c> Revivals<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &RevivalFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM revivals
            WHERE service_id = $1
              AND ($2::revival_status IS NULL OR status = $2)
              AND ($3::text IS NULL OR LOWER(mail_subject) LIKE $3)
            "#,
        )
        .bind(filter.service_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Active revivals in one of `statuses`, across all services
    #[instrument(skip(self), err)]
    pub async fn list_active(&mut self, statuses: &[RevivalStatus]) -> Result<Vec<RevivalDBResponse>> {
        let revivals = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            "SELECT {REVIVAL_COLUMNS} FROM revivals WHERE is_active AND status = ANY($1) ORDER BY created_at"
        ))
        .bind(statuses)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(revivals)
    }

    /// Complete revivals last run on or before `ran_before`
    #[instrument(skip(self), err)]
    pub async fn list_complete_since(&mut self, ran_before: DateTime<Utc>) -> Result<Vec<RevivalDBResponse>> {
        let revivals = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            "SELECT {REVIVAL_COLUMNS} FROM revivals WHERE is_active AND status = 'complete' AND run_on <= $1 ORDER BY run_on"
        ))
        .bind(ran_before)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(revivals)
    }

    /// Claim the revival for one run. Only one caller gets `true` until [`Self::release_run`],
    /// unless the claim dates from before `stale_before`: its runner died without releasing it.
    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn try_start_run(&mut self, id: RevivalId, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE revivals SET is_running = TRUE, run_claimed_at = $2
            WHERE id = $1 AND (NOT is_running OR run_claimed_at IS NULL OR run_claimed_at < $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .execute(&mut *self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn release_run(&mut self, id: RevivalId) -> Result<()> {
        sqlx::query("UPDATE revivals SET is_running = FALSE, run_claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id), to = %to), err)]
    pub async fn transition(&mut self, id: RevivalId, to: RevivalStatus) -> std::result::Result<RevivalDBResponse, Error> {
        let current = self.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Revival".to_string(),
            id: id.to_string(),
        })?;
        current.status.transition(to)?;

        let updated = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            "UPDATE revivals SET status = $3 WHERE id = $1 AND status = $2 RETURNING {REVIVAL_COLUMNS}"
        ))
        .bind(id)
        .bind(current.status)
        .bind(to)
        .fetch_optional(&mut *self.db)
        .await
        .map_err(DbError::from)?;

        updated.ok_or_else(|| Error::InvalidTransition {
            entity: RevivalStatus::ENTITY.to_string(),
            from: current.status.to_string(),
            to: to.to_string(),
        })
    }

    /// Record the start of a run: when it happened and how many targets it covers in total
    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_run(&mut self, id: RevivalId, run_on: DateTime<Utc>, total: i32) -> Result<RevivalDBResponse> {
        let revival = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            "UPDATE revivals SET run_on = $2, total = $3 WHERE id = $1 RETURNING {REVIVAL_COLUMNS}"
        ))
        .bind(id)
        .bind(run_on)
        .bind(total)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(revival)
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn add_progress(&mut self, id: RevivalId, sent: i32) -> Result<RevivalDBResponse> {
        let revival = sqlx::query_as::<_, RevivalDBResponse>(&format!(
            "UPDATE revivals SET progress = progress + $2 WHERE id = $1 RETURNING {REVIVAL_COLUMNS}"
        ))
        .bind(id)
        .bind(sent)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(revival)
    }

    /// Create targets for one chunk of matching members, ordered by join date.
    /// `joined_after` restricts the chunk to members who joined after a previous run.
    #[instrument(skip(self, revival), fields(revival_id = %abbrev_uuid(&revival.id), skip, limit), err)]
    pub async fn add_matching_targets(
        &mut self,
        revival: &RevivalDBResponse,
        joined_after: Option<DateTime<Utc>>,
        skip: i64,
        limit: i64,
    ) -> Result<TargetChunk> {
        let (scanned, inserted): (i64, i64) = sqlx::query_as(&format!(
            r#"
            WITH candidates AS ({MATCHING_MEMBERS}),
            inserted AS (
                INSERT INTO targets (revival_id, member_id)
                SELECT $1, c.id FROM candidates c
                ON CONFLICT (revival_id, member_id) DO NOTHING
                RETURNING 1
            )
            SELECT (SELECT COUNT(*) FROM candidates), (SELECT COUNT(*) FROM inserted)
            "#
        ))
        .bind(revival.id)
        .bind(&revival.model_name)
        .bind(revival.object_id)
        .bind(joined_after)
        .bind(limit)
        .bind(skip)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(TargetChunk { scanned, inserted })
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn count_targets(&mut self, id: RevivalId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM targets WHERE revival_id = $1")
            .bind(id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    /// Targets not notified yet
    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn pending_targets(&mut self, id: RevivalId, limit: i64) -> Result<Vec<TargetDBResponse>> {
        let targets = sqlx::query_as::<_, TargetDBResponse>(&format!(
            r#"
            SELECT {TARGET_COLUMNS} FROM targets t JOIN members m ON m.id = t.member_id
            WHERE t.revival_id = $1 AND NOT t.notified
            ORDER BY t.created_at, t.member_id
            LIMIT $2
            "#
        ))
        .bind(id)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(targets)
    }

    /// Targets reached fewer than `max_count` times, least recently reached first
    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&id)), err)]
    pub async fn targets_for_rerun(&mut self, id: RevivalId, max_count: i32, limit: i64) -> Result<Vec<TargetDBResponse>> {
        let targets = sqlx::query_as::<_, TargetDBResponse>(&format!(
            r#"
            SELECT {TARGET_COLUMNS} FROM targets t JOIN members m ON m.id = t.member_id
            WHERE t.revival_id = $1 AND t.revival_count < $2
            ORDER BY t.revival_count, t.created_at
            LIMIT $3
            "#
        ))
        .bind(id)
        .bind(max_count)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(targets)
    }

    #[instrument(skip(self), fields(revival_id = %abbrev_uuid(&revival_id), member_id = %abbrev_uuid(&member_id)), err)]
    pub async fn mark_target_notified(&mut self, revival_id: RevivalId, member_id: MemberId) -> Result<()> {
        sqlx::query("UPDATE targets SET notified = TRUE, revival_count = revival_count + 1 WHERE revival_id = $1 AND member_id = $2")
            .bind(revival_id)
            .bind(member_id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::ProfileTags;
    use crate::db::models::revivals::ProfileTagCreateDBRequest;
    use crate::test_utils::{create_test_member, create_test_service};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_single_runner(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Revivals::new(&mut conn);
        let revival = repo
            .create(&RevivalCreateDBRequest {
                service_id: service.id,
                model_name: "kako.Product".to_string(),
                object_id: Uuid::new_v4(),
                mail_subject: "New arrivals".to_string(),
                mail_content: "Come and see".to_string(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let stale_before = now - chrono::Duration::hours(1);
        assert!(repo.try_start_run(revival.id, now, stale_before).await.unwrap());
        assert!(!repo.try_start_run(revival.id, now, stale_before).await.unwrap());
        repo.release_run(revival.id).await.unwrap();
        assert!(repo.try_start_run(revival.id, now, stale_before).await.unwrap());

        // A claim left by a runner that died is taken over once stale
        let later = now + chrono::Duration::hours(2);
        assert!(!repo.try_start_run(revival.id, later, now - chrono::Duration::minutes(1)).await.unwrap());
        assert!(repo.try_start_run(revival.id, later, now + chrono::Duration::minutes(1)).await.unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_targets_match_object_tags(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let fan = create_test_member(&pool, "fan@example.com").await;
        let stranger = create_test_member(&pool, "stranger@example.com").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let object_id = Uuid::new_v4();
        let mut conn = pool.acquire().await.unwrap();

        let mut tags = ProfileTags::new(&mut conn);
        let shoes = tags
            .create(&ProfileTagCreateDBRequest {
                service_id: service.id,
                name: "Shoes".to_string(),
                slug: "shoes".to_string(),
                is_reserved: false,
                is_auto: false,
            })
            .await
            .unwrap();
        let bags = tags
            .create(&ProfileTagCreateDBRequest {
                service_id: service.id,
                name: "Bags".to_string(),
                slug: "bags".to_string(),
                is_reserved: false,
                is_auto: false,
            })
            .await
            .unwrap();
        tags.set_member_tags(service.id, fan.id, &[shoes.id]).await.unwrap();
        tags.set_member_tags(service.id, stranger.id, &[bags.id]).await.unwrap();
        tags.set_object_tags(service.id, "kako.Product", object_id, &[shoes.id]).await.unwrap();

        let mut repo = Revivals::new(&mut conn);
        let revival = repo
            .create(&RevivalCreateDBRequest {
                service_id: service.id,
                model_name: "kako.Product".to_string(),
                object_id,
                mail_subject: "Shoes".to_string(),
                mail_content: "New shoes".to_string(),
            })
            .await
            .unwrap();

        let chunk = repo.add_matching_targets(&revival, None, 0, 500).await.unwrap();
        assert_eq!(chunk, TargetChunk { scanned: 1, inserted: 1 });
        let again = repo.add_matching_targets(&revival, None, 0, 500).await.unwrap();
        assert_eq!(again.inserted, 0);

        let pending = repo.pending_targets(revival.id, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].member_id, fan.id);

        repo.mark_target_notified(revival.id, fan.id).await.unwrap();
        assert!(repo.pending_targets(revival.id, 10).await.unwrap().is_empty());
        assert_eq!(repo.targets_for_rerun(revival.id, 5, 10).await.unwrap()[0].revival_count, 1);
    }
}
