//! Database repository for cyclic revivals and their targets.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::revivals::{CyclicRevivalCreateDBRequest, CyclicRevivalDBResponse, CyclicRevivalUpdateDBRequest, TargetDBResponse},
};
use crate::types::{CyclicRevivalId, MemberId, ProfileTagId, ServiceId, abbrev_uuid};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const CYCLIC_COLUMNS: &str = "id, service_id, profile_tag_id, hour_of_sending, days_cycle, day_of_week_list, day_of_month_list, \
     mail_subject, mail_content, sms_text, next_run_on, end_on, is_active, is_running, created_at";

#[derive(Debug, Clone)]
pub struct CyclicRevivalFilter {
    pub service_id: ServiceId,
    pub query: ListQuery,
}

pub struct CyclicRevivals<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for CyclicRevivals<'c> {
    type CreateRequest = CyclicRevivalCreateDBRequest;
    type UpdateRequest = CyclicRevivalUpdateDBRequest;
    type Response = CyclicRevivalDBResponse;
    type Id = CyclicRevivalId;
    type Filter = CyclicRevivalFilter;

    #[instrument(skip(self, request), fields(tag_id = %abbrev_uuid(&request.profile_tag_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let revival = sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!(
            r#"
            INSERT INTO cyclic_revivals (id, service_id, profile_tag_id, hour_of_sending, days_cycle, day_of_week_list,
                day_of_month_list, mail_subject, mail_content, sms_text, next_run_on, end_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {CYCLIC_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(request.profile_tag_id)
        .bind(request.hour_of_sending)
        .bind(request.days_cycle)
        .bind(&request.day_of_week_list)
        .bind(&request.day_of_month_list)
        .bind(&request.mail_subject)
        .bind(&request.mail_content)
        .bind(&request.sms_text)
        .bind(request.next_run_on)
        .bind(request.end_on)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(revival)
    }

    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let revival =
            sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!("SELECT {CYCLIC_COLUMNS} FROM cyclic_revivals WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(revival)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let revivals =
            sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!("SELECT {CYCLIC_COLUMNS} FROM cyclic_revivals WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(revivals.into_iter().map(|r| (r.id, r)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let revivals = sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!(
            r#"
            SELECT {CYCLIC_COLUMNS} FROM cyclic_revivals
            WHERE service_id = $1 AND ($2::text IS NULL OR LOWER(mail_subject) LIKE $2)
            ORDER BY next_run_on, hour_of_sending
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(revivals)
    }

    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cyclic_revivals WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let revival = sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!(
            r#"
            UPDATE cyclic_revivals SET
                hour_of_sending = COALESCE($2, hour_of_sending),
                days_cycle = COALESCE($3, days_cycle),
                day_of_week_list = COALESCE($4, day_of_week_list),
                day_of_month_list = COALESCE($5, day_of_month_list),
                mail_subject = COALESCE($6, mail_subject),
                mail_content = COALESCE($7, mail_content),
                sms_text = COALESCE($8, sms_text),
                next_run_on = COALESCE($9, next_run_on),
                end_on = COALESCE($10, end_on),
                is_active = COALESCE($11, is_active)
            WHERE id = $1
            RETURNING {CYCLIC_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.hour_of_sending)
        .bind(request.days_cycle)
        .bind(&request.day_of_week_list)
        .bind(&request.day_of_month_list)
        .bind(&request.mail_subject)
        .bind(&request.mail_content)
        .bind(&request.sms_text)
        .bind(request.next_run_on)
        .bind(request.end_on)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(revival)
    }
}

impl<'c> CyclicRevivals<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &CyclicRevivalFilter) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cyclic_revivals WHERE service_id = $1 AND ($2::text IS NULL OR LOWER(mail_subject) LIKE $2)")
                .bind(filter.service_id)
                .bind(filter.query.search_pattern())
                .fetch_one(&mut *self.db)
                .await?;
        Ok(count)
    }

    /// Active cyclic revivals scheduled for `today` at `hour` that have not reached their end date
    #[instrument(skip(self), err)]
    pub async fn list_due(&mut self, today: NaiveDate, hour: i32) -> Result<Vec<CyclicRevivalDBResponse>> {
        let revivals = sqlx::query_as::<_, CyclicRevivalDBResponse>(&format!(
            r#"
            SELECT {CYCLIC_COLUMNS} FROM cyclic_revivals
            WHERE is_active AND next_run_on = $1 AND hour_of_sending = $2 AND (end_on IS NULL OR end_on > $1)
            ORDER BY created_at
            "#
        ))
        .bind(today)
        .bind(hour)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(revivals)
    }

    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    pub async fn try_start_run(&mut self, id: CyclicRevivalId, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cyclic_revivals SET is_running = TRUE, run_claimed_at = $2
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

    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    pub async fn release_run(&mut self, id: CyclicRevivalId) -> Result<()> {
        sqlx::query("UPDATE cyclic_revivals SET is_running = FALSE, run_claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id), %next_run_on), err)]
    pub async fn set_next_run_on(&mut self, id: CyclicRevivalId, next_run_on: NaiveDate) -> Result<()> {
        sqlx::query("UPDATE cyclic_revivals SET next_run_on = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run_on)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Target every active member of the tag that has an email or a phone. Returns the number
    /// of targets created.
    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    pub async fn add_tag_targets(&mut self, id: CyclicRevivalId, tag_id: ProfileTagId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO cyclic_targets (revival_id, member_id)
            SELECT $1, m.id FROM members m
            JOIN member_profiles mp ON mp.member_id = m.id
            WHERE mp.tag_id = $2 AND m.is_active AND NOT m.is_ghost
              AND (m.email IS NOT NULL OR m.phone IS NOT NULL)
            ORDER BY m.date_joined
            ON CONFLICT (revival_id, member_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(tag_id)
        .execute(&mut *self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Targets of a cyclic revival in join order. `notified` is reported as false.
    #[instrument(skip(self), fields(cyclic_revival_id = %abbrev_uuid(&id)), err)]
    pub async fn targets(&mut self, id: CyclicRevivalId, skip: i64, limit: i64) -> Result<Vec<TargetDBResponse>> {
        let targets = sqlx::query_as::<_, TargetDBResponse>(
            r#"
            SELECT t.revival_id, t.member_id, t.revival_count, FALSE AS notified, t.updated_at AS created_at,
                   m.email, m.phone, m.first_name, m.language
            FROM cyclic_targets t JOIN members m ON m.id = t.member_id
            WHERE t.revival_id = $1 AND m.is_active
            ORDER BY m.date_joined, m.id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(targets)
    }

    #[instrument(skip(self), err)]
    pub async fn record_reached(&mut self, id: CyclicRevivalId, member_id: MemberId) -> Result<()> {
        sqlx::query("UPDATE cyclic_targets SET revival_count = revival_count + 1, updated_at = NOW() WHERE revival_id = $1 AND member_id = $2")
            .bind(id)
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
    use chrono::Utc;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_due_selection_and_targets(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let fan = create_test_member(&pool, "fan").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let today = Utc::now().date_naive();
        let mut conn = pool.acquire().await.unwrap();

        let mut tags = ProfileTags::new(&mut conn);
        let tag = tags
            .create(&ProfileTagCreateDBRequest {
                service_id: service.id,
                name: "Regulars".to_string(),
                slug: "regulars".to_string(),
                is_reserved: false,
                is_auto: false,
            })
            .await
            .unwrap();
        tags.set_member_tags(service.id, fan.id, &[tag.id]).await.unwrap();

        let mut repo = CyclicRevivals::new(&mut conn);
        let revival = repo
            .create(&CyclicRevivalCreateDBRequest {
                service_id: service.id,
                profile_tag_id: tag.id,
                hour_of_sending: 9,
                days_cycle: Some(7),
                day_of_week_list: vec![],
                day_of_month_list: vec![],
                mail_subject: "Weekly".to_string(),
                mail_content: "Hello $client".to_string(),
                sms_text: String::new(),
                next_run_on: today,
                end_on: None,
            })
            .await
            .unwrap();

        assert_eq!(repo.list_due(today, 9).await.unwrap().len(), 1);
        assert!(repo.list_due(today, 10).await.unwrap().is_empty());

        assert_eq!(repo.add_tag_targets(revival.id, tag.id).await.unwrap(), 1);
        assert_eq!(repo.add_tag_targets(revival.id, tag.id).await.unwrap(), 0);
        let targets = repo.targets(revival.id, 0, 500).await.unwrap();
        assert_eq!(targets[0].member_id, fan.id);

        repo.update(
            revival.id,
            &CyclicRevivalUpdateDBRequest {
                end_on: Some(today),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(repo.list_due(today, 9).await.unwrap().is_empty());
    }
}
