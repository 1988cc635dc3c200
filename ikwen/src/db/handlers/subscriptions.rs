//! Database repository for subscriptions.

use std::collections::HashMap;

use crate::billing::status::{StatusMachine, SubscriptionStatus};
use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::subscriptions::{SubscriptionCreateDBRequest, SubscriptionDBResponse, SubscriptionUpdateDBRequest},
};
use crate::errors::Error;
use crate::types::{MemberId, ServiceId, SubscriptionId, abbrev_uuid};
use chrono::NaiveDate;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "id, service_id, member_id, product_id, monthly_cost, billing_cycle, details, expiry, \
     invoice_tolerance, status, since, updated_at";

#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub service_id: ServiceId,
    pub member_id: Option<MemberId>,
    pub status: Option<SubscriptionStatus>,
    pub query: ListQuery,
}

pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Subscriptions<'c> {
    type CreateRequest = SubscriptionCreateDBRequest;
    type UpdateRequest = SubscriptionUpdateDBRequest;
    type Response = SubscriptionDBResponse;
    type Id = SubscriptionId;
    type Filter = SubscriptionFilter;

    #[instrument(skip(self, request), fields(member_id = %abbrev_uuid(&request.member_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            INSERT INTO subscriptions (id, service_id, member_id, product_id, monthly_cost, billing_cycle, details, expiry,
                invoice_tolerance, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(request.member_id)
        .bind(request.product_id)
        .bind(request.monthly_cost)
        .bind(request.billing_cycle)
        .bind(&request.details)
        .bind(request.expiry)
        .bind(request.invoice_tolerance)
        .bind(request.status)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let subscription =
            sqlx::query_as::<_, SubscriptionDBResponse>(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(subscription)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let subscriptions =
            sqlx::query_as::<_, SubscriptionDBResponse>(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(subscriptions.into_iter().map(|s| (s.id, s)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let subscriptions = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE service_id = $1
              AND ($2::uuid IS NULL OR member_id = $2)
              AND ($3::subscription_status IS NULL OR status = $3)
              AND ($4::text IS NULL OR LOWER(details) LIKE $4)
            ORDER BY since DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.member_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            UPDATE subscriptions SET
                product_id = COALESCE($2, product_id),
                monthly_cost = COALESCE($3, monthly_cost),
                billing_cycle = COALESCE($4, billing_cycle),
                details = COALESCE($5, details),
                expiry = COALESCE($6, expiry),
                invoice_tolerance = COALESCE($7, invoice_tolerance),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.product_id)
        .bind(request.monthly_cost)
        .bind(request.billing_cycle)
        .bind(&request.details)
        .bind(request.expiry)
        .bind(request.invoice_tolerance)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(subscription)
    }
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &SubscriptionFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE service_id = $1
              AND ($2::uuid IS NULL OR member_id = $2)
              AND ($3::subscription_status IS NULL OR status = $3)
              AND ($4::text IS NULL OR LOWER(details) LIKE $4)
            "#,
        )
        .bind(filter.service_id)
        .bind(filter.member_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Move a subscription to a new status following its transition table. The write is
    /// conditional on the status read, so a concurrent change surfaces as a rejected transition.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id), to = %to), err)]
    pub async fn transition(&mut self, id: SubscriptionId, to: SubscriptionStatus) -> std::result::Result<SubscriptionDBResponse, Error> {
        let current = self.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: id.to_string(),
        })?;
        current.status.transition(to)?;

        let updated = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            "UPDATE subscriptions SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id)
        .bind(current.status)
        .bind(to)
        .fetch_optional(&mut *self.db)
        .await
        .map_err(DbError::from)?;

        updated.ok_or_else(|| Error::InvalidTransition {
            entity: SubscriptionStatus::ENTITY.to_string(),
            from: current.status.to_string(),
            to: to.to_string(),
        })
    }

    /// Set the paid-until date of a subscription
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    pub async fn set_expiry(&mut self, id: SubscriptionId, expiry: NaiveDate) -> Result<SubscriptionDBResponse> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            "UPDATE subscriptions SET expiry = $2, updated_at = NOW() WHERE id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id)
        .bind(expiry)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(subscription)
    }

    /// Active paying subscriptions of a service expiring on `expiry`
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id), %expiry), err)]
    pub async fn list_expiring_on(&mut self, service_id: ServiceId, expiry: NaiveDate) -> Result<Vec<SubscriptionDBResponse>> {
        let subscriptions = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE service_id = $1 AND status = 'active' AND monthly_cost > 0 AND expiry = $2
            ORDER BY since
            "#
        ))
        .bind(service_id)
        .bind(expiry)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(subscriptions)
    }
}
