//! Database repository for console events, sending reports and queued SMS.

use crate::db::{
    errors::Result,
    handlers::repository::ListQuery,
    models::events::{ConsoleEventCreateDBRequest, ConsoleEventDBResponse, EventType, SendingReportDBResponse},
};
use crate::types::{MemberId, ServiceId, abbrev_uuid};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Filter for a member's console feed
#[derive(Debug, Clone)]
pub struct ConsoleEventFilter {
    pub member_id: MemberId,
    pub service_id: Option<ServiceId>,
    pub query: ListQuery,
}

pub struct Events<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Events<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(event_type = request.event_type.as_str()), err)]
    pub async fn create(&mut self, request: &ConsoleEventCreateDBRequest) -> Result<ConsoleEventDBResponse> {
        let event = sqlx::query_as::<_, ConsoleEventDBResponse>(
            r#"
            INSERT INTO console_events (id, service_id, member_id, event_type, object_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, service_id, member_id, event_type, object_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(request.member_id)
        .bind(request.event_type.as_str())
        .bind(request.object_id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(event)
    }

    /// Events of a member, newest first, optionally restricted to one service
    #[instrument(skip(self, filter), fields(member_id = %abbrev_uuid(&filter.member_id)), err)]
    pub async fn list(&mut self, filter: &ConsoleEventFilter) -> Result<Vec<ConsoleEventDBResponse>> {
        let events = sqlx::query_as::<_, ConsoleEventDBResponse>(
            r#"
            SELECT id, service_id, member_id, event_type, object_id, created_at FROM console_events
            WHERE member_id = $1 AND ($2::uuid IS NULL OR service_id = $2)
              AND ($3::text IS NULL OR LOWER(event_type) LIKE $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.member_id)
        .bind(filter.service_id)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(events)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &ConsoleEventFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM console_events
            WHERE member_id = $1 AND ($2::uuid IS NULL OR service_id = $2)
              AND ($3::text IS NULL OR LOWER(event_type) LIKE $3)
            "#,
        )
        .bind(filter.member_id)
        .bind(filter.service_id)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Events of one type for a service, used to check what a job recorded
    #[instrument(skip(self), err)]
    pub async fn list_for_service(&mut self, service_id: ServiceId, event_type: EventType) -> Result<Vec<ConsoleEventDBResponse>> {
        let events = sqlx::query_as::<_, ConsoleEventDBResponse>(
            r#"
            SELECT id, service_id, member_id, event_type, object_id, created_at FROM console_events
            WHERE service_id = $1 AND event_type = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(service_id)
        .bind(event_type.as_str())
        .fetch_all(&mut *self.db)
        .await?;
        Ok(events)
    }

    /// Whether an event of this type was recorded for the service at or after `since`
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id), event_type = event_type.as_str()), err)]
    pub async fn exists_since(&mut self, service_id: ServiceId, event_type: EventType, since: DateTime<Utc>) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM console_events WHERE service_id = $1 AND event_type = $2 AND created_at >= $3)",
        )
        .bind(service_id)
        .bind(event_type.as_str())
        .bind(since)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(exists)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id), kind = kind.as_str()), err)]
    pub async fn create_sending_report(
        &mut self,
        service_id: ServiceId,
        kind: EventType,
        count: i32,
        total_amount: Decimal,
    ) -> Result<SendingReportDBResponse> {
        let report = sqlx::query_as::<_, SendingReportDBResponse>(
            r#"
            INSERT INTO sending_reports (id, service_id, kind, count, total_amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, service_id, kind, count, total_amount, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(service_id)
        .bind(kind.as_str())
        .bind(count)
        .bind(total_amount)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(report)
    }

    #[instrument(skip(self), err)]
    pub async fn list_sending_reports(&mut self, service_id: ServiceId) -> Result<Vec<SendingReportDBResponse>> {
        let reports = sqlx::query_as::<_, SendingReportDBResponse>(
            "SELECT id, service_id, kind, count, total_amount, created_at FROM sending_reports WHERE service_id = $1 ORDER BY created_at DESC",
        )
        .bind(service_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(reports)
    }

    /// Store an SMS for an external sender (the `queue` sending method)
    #[instrument(skip(self, text), err)]
    pub async fn queue_sms(&mut self, service_id: ServiceId, recipient: &str, text: &str) -> Result<()> {
        sqlx::query("INSERT INTO queued_sms (id, service_id, recipient, text) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(service_id)
            .bind(recipient)
            .bind(text)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn count_queued_sms(&mut self, service_id: ServiceId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queued_sms WHERE service_id = $1")
            .bind(service_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }
}
