//! Database repository for invoices.

use std::collections::HashMap;

use crate::billing::status::{InvoiceStatus, StatusMachine};
use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::invoices::{InvoiceCreateDBRequest, InvoiceDBResponse, InvoiceUpdateDBRequest},
};
use crate::errors::Error;
use crate::types::{InvoiceId, MemberId, Operation, ServiceId, SubscriptionId, abbrev_uuid};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, types::Json};
use tracing::instrument;
use uuid::Uuid;

const INVOICE_COLUMNS: &str = "id, service_id, subscription_id, member_id, number, amount, paid, processing_fees, \
     months_count, date_issued, due_date, reminders_sent, last_reminder, overdue_notices_sent, last_overdue_notice, \
     status, is_one_off, entries, updated_at";

#[derive(Debug, Clone)]
pub struct InvoiceFilter {
    pub service_id: ServiceId,
    pub member_id: Option<MemberId>,
    pub subscription_id: Option<SubscriptionId>,
    pub status: Option<InvoiceStatus>,
    pub query: ListQuery,
}

impl InvoiceFilter {
    pub fn new(service_id: ServiceId, query: ListQuery) -> Self {
        Self {
            service_id,
            member_id: None,
            subscription_id: None,
            status: None,
            query,
        }
    }
}

pub struct Invoices<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Invoices<'c> {
    type CreateRequest = InvoiceCreateDBRequest;
    type UpdateRequest = InvoiceUpdateDBRequest;
    type Response = InvoiceDBResponse;
    type Id = InvoiceId;
    type Filter = InvoiceFilter;

    #[instrument(skip(self, request), fields(number = %request.number), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let invoice = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            INSERT INTO invoices (id, service_id, subscription_id, member_id, number, amount, months_count, date_issued,
                due_date, is_one_off, entries)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(request.subscription_id)
        .bind(request.member_id)
        .bind(&request.number)
        .bind(request.amount)
        .bind(request.months_count)
        .bind(request.date_issued)
        .bind(request.due_date)
        .bind(request.is_one_off)
        .bind(Json(&request.entries))
        .fetch_one(&mut *self.db)
        .await?;
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let invoice = sqlx::query_as::<_, InvoiceDBResponse>(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(invoice)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let invoices = sqlx::query_as::<_, InvoiceDBResponse>(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(invoices.into_iter().map(|i| (i.id, i)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let invoices = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE service_id = $1
              AND ($2::uuid IS NULL OR member_id = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
              AND ($4::invoice_status IS NULL OR status = $4)
              AND ($5::text IS NULL OR LOWER(number) LIKE $5)
            ORDER BY date_issued DESC
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.member_id)
        .bind(filter.subscription_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(invoices)
    }

    /// Paid invoices are kept as accounting records
    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        if let Some(invoice) = self.get_by_id(id).await?
            && invoice.paid > Decimal::ZERO
        {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: "invoice has received payments".to_string(),
                entity_type: "Invoice".to_string(),
                entity_id: Some(id.to_string()),
            });
        }
        let result = sqlx::query("DELETE FROM invoices WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(invoice_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let invoice = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            UPDATE invoices SET
                amount = COALESCE($2, amount),
                due_date = COALESCE($3, due_date),
                months_count = COALESCE($4, months_count),
                entries = COALESCE($5, entries),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'paid'
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.amount)
        .bind(request.due_date)
        .bind(request.months_count)
        .bind(request.entries.as_ref().map(Json))
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(invoice)
    }
}

impl<'c> Invoices<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &InvoiceFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM invoices
            WHERE service_id = $1
              AND ($2::uuid IS NULL OR member_id = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
              AND ($4::invoice_status IS NULL OR status = $4)
              AND ($5::text IS NULL OR LOWER(number) LIKE $5)
            "#,
        )
        .bind(filter.service_id)
        .bind(filter.member_id)
        .bind(filter.subscription_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Total number of invoices ever issued by a service, used for numbering
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn count_for_service(&mut self, service_id: ServiceId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE service_id = $1")
            .bind(service_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get_by_number(&mut self, service_id: ServiceId, number: &str) -> Result<Option<InvoiceDBResponse>> {
        let invoice =
            sqlx::query_as::<_, InvoiceDBResponse>(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE service_id = $1 AND number = $2"))
                .bind(service_id)
                .bind(number)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(invoice)
    }

    /// Whether a subscription already has an unpaid invoice
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    pub async fn has_open_invoice(&mut self, subscription_id: SubscriptionId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM invoices WHERE subscription_id = $1 AND status <> 'paid')")
                .bind(subscription_id)
                .fetch_one(&mut *self.db)
                .await?;
        Ok(exists)
    }

    /// Add `amount` to the paid total of an invoice. Payments that would exceed the invoice
    /// amount are rejected, and the invoice becomes Paid once fully covered.
    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id), %amount), err)]
    pub async fn add_payment(&mut self, id: InvoiceId, amount: Decimal) -> std::result::Result<InvoiceDBResponse, Error> {
        if amount <= Decimal::ZERO {
            return Err(Error::BadRequest {
                message: "Payment amount must be positive".to_string(),
            });
        }
        let current = self.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Invoice".to_string(),
            id: id.to_string(),
        })?;
        if current.status == InvoiceStatus::Paid {
            return Err(Error::Conflict {
                message: format!("Invoice {} is already paid", current.number),
            });
        }

        let updated = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            UPDATE invoices SET
                paid = paid + $2,
                status = CASE WHEN paid + $2 >= amount THEN 'paid'::invoice_status ELSE status END,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'paid' AND paid + $2 <= amount
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(amount)
        .fetch_optional(&mut *self.db)
        .await
        .map_err(DbError::from)?;

        updated.ok_or_else(|| Error::BadRequest {
            message: format!("Payment of {amount} exceeds the balance due on invoice {}", current.number),
        })
    }

    /// Move an invoice to a new status following its transition table
    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id), to = %to), err)]
    pub async fn transition(&mut self, id: InvoiceId, to: InvoiceStatus) -> std::result::Result<InvoiceDBResponse, Error> {
        let current = self.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Invoice".to_string(),
            id: id.to_string(),
        })?;
        current.status.transition(to)?;

        let updated = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            "UPDATE invoices SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2 RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(id)
        .bind(current.status)
        .bind(to)
        .fetch_optional(&mut *self.db)
        .await
        .map_err(DbError::from)?;

        updated.ok_or_else(|| Error::InvalidTransition {
            entity: InvoiceStatus::ENTITY.to_string(),
            from: current.status.to_string(),
            to: to.to_string(),
        })
    }

    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id)), err)]
    pub async fn set_processing_fees(&mut self, id: InvoiceId, fees: Decimal) -> Result<()> {
        sqlx::query("UPDATE invoices SET processing_fees = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(fees)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id)), err)]
    pub async fn record_reminder(&mut self, id: InvoiceId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE invoices SET reminders_sent = reminders_sent + 1, last_reminder = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&id)), err)]
    pub async fn record_overdue_notice(&mut self, id: InvoiceId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE invoices SET overdue_notices_sent = overdue_notices_sent + 1, last_overdue_notice = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// Pending invoices of a service due on or after `today` that were already sent once.
    /// The caller checks the reminder delay against `last_reminder`.
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn list_reminder_candidates(&mut self, service_id: ServiceId, today: NaiveDate) -> Result<Vec<InvoiceDBResponse>> {
        let invoices = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE service_id = $1 AND status = 'pending' AND due_date >= $2 AND last_reminder IS NOT NULL
            ORDER BY due_date
            "#
        ))
        .bind(service_id)
        .bind(today)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(invoices)
    }

    /// Unpaid invoices of a service whose due date is before `today` and that got fewer than
    /// three overdue notices
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn list_past_due(&mut self, service_id: ServiceId, today: NaiveDate) -> Result<Vec<InvoiceDBResponse>> {
        let invoices = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE service_id = $1 AND status IN ('pending', 'overdue') AND due_date < $2 AND overdue_notices_sent < 3
            ORDER BY due_date
            "#
        ))
        .bind(service_id)
        .bind(today)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(invoices)
    }

    /// Overdue invoices of a service whose due date is on or before `deadline`
    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn list_overdue_before(&mut self, service_id: ServiceId, deadline: NaiveDate) -> Result<Vec<InvoiceDBResponse>> {
        let invoices = sqlx::query_as::<_, InvoiceDBResponse>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE service_id = $1 AND status = 'overdue' AND due_date <= $2
            ORDER BY due_date
            "#
        ))
        .bind(service_id)
        .bind(deadline)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cycle::BillingCycle;
    use crate::billing::status::SubscriptionStatus;
    use crate::db::handlers::Subscriptions;
    use crate::db::models::{invoices::InvoiceEntry, subscriptions::SubscriptionCreateDBRequest};
    use crate::test_utils::{create_test_member, create_test_service};
    use sqlx::PgPool;

    async fn setup_invoice(pool: &PgPool, amount: Decimal) -> InvoiceDBResponse {
        let member = create_test_member(pool, "payer").await;
        let service = create_test_service(pool, member.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                service_id: service.id,
                member_id: member.id,
                product_id: None,
                monthly_cost: amount,
                billing_cycle: BillingCycle::Monthly,
                details: "Hosting".to_string(),
                expiry: None,
                invoice_tolerance: 1,
                status: SubscriptionStatus::Active,
            })
            .await
            .unwrap();
        Invoices::new(&mut conn)
            .create(&InvoiceCreateDBRequest {
                service_id: service.id,
                subscription_id: subscription.id,
                member_id: Some(member.id),
                number: "A1/0125".to_string(),
                amount,
                months_count: 1,
                date_issued: Utc::now(),
                due_date: Utc::now().date_naive(),
                is_one_off: false,
                entries: vec![InvoiceEntry::new("Hosting", 1, amount)],
            })
            .await
            .unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_partial_then_full_payment(pool: PgPool) {
        let invoice = setup_invoice(&pool, Decimal::from(10_000)).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Invoices::new(&mut conn);

        let partial = repo.add_payment(invoice.id, Decimal::from(4_000)).await.unwrap();
        assert_eq!(partial.paid, Decimal::from(4_000));
        assert_eq!(partial.status, InvoiceStatus::Pending);
        assert_eq!(partial.balance_due(), Decimal::from(6_000));

        let full = repo.add_payment(invoice.id, Decimal::from(6_000)).await.unwrap();
        assert_eq!(full.status, InvoiceStatus::Paid);
        assert_eq!(full.entries.0.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_overpayment_is_rejected(pool: PgPool) {
        let invoice = setup_invoice(&pool, Decimal::from(5_000)).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Invoices::new(&mut conn);

        let err = repo.add_payment(invoice.id, Decimal::from(5_001)).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
        let unchanged = repo.get_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(unchanged.paid, Decimal::ZERO);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_paid_invoice_cannot_go_overdue(pool: PgPool) {
        let invoice = setup_invoice(&pool, Decimal::from(1_000)).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Invoices::new(&mut conn);

        repo.add_payment(invoice.id, Decimal::from(1_000)).await.unwrap();
        let err = repo.transition(invoice.id, InvoiceStatus::Overdue).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(repo.delete(invoice.id).await.is_err());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reminder_candidates_need_a_first_send(pool: PgPool) {
        let invoice = setup_invoice(&pool, Decimal::from(1_000)).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Invoices::new(&mut conn);
        let now = Utc::now();
        let today = now.date_naive();

        assert!(repo.list_reminder_candidates(invoice.service_id, today).await.unwrap().is_empty());

        repo.record_reminder(invoice.id, now).await.unwrap();
        let due = repo.list_reminder_candidates(invoice.service_id, today).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reminders_sent, 1);

        let tomorrow = today + chrono::Duration::days(1);
        assert!(repo.list_reminder_candidates(invoice.service_id, tomorrow).await.unwrap().is_empty());
    }
}
