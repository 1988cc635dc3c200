//! Database repositories for invoice payments and tenant payment means.

use crate::db::{
    errors::{DbError, Result},
    models::payments::{PaymentCreateDBRequest, PaymentDBResponse, PaymentMeanCreateDBRequest, PaymentMeanDBResponse},
};
use crate::types::{InvoiceId, PaymentMeanId, ServiceId, abbrev_uuid};
use sqlx::{PgConnection, types::Json};
use tracing::instrument;
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, invoice_id, method, amount, cashier_id, processor_tx_id, created_at";
const PAYMENT_MEAN_COLUMNS: &str = "id, service_id, name, slug, credentials, is_active";

/// Payments are append-only: no update or delete
pub struct Payments<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Payments<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(invoice_id = %abbrev_uuid(&request.invoice_id), method = %request.method), err)]
    pub async fn create(&mut self, request: &PaymentCreateDBRequest) -> Result<PaymentDBResponse> {
        let payment = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            r#"
            INSERT INTO payments (id, invoice_id, method, amount, cashier_id, processor_tx_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.invoice_id)
        .bind(request.method.as_str())
        .bind(request.amount)
        .bind(request.cashier_id)
        .bind(&request.processor_tx_id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(payment)
    }

    #[instrument(skip(self), fields(invoice_id = %abbrev_uuid(&invoice_id)), err)]
    pub async fn list_for_invoice(&mut self, invoice_id: InvoiceId) -> Result<Vec<PaymentDBResponse>> {
        let payments =
            sqlx::query_as::<_, PaymentDBResponse>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1 ORDER BY created_at"))
                .bind(invoice_id)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(payments)
    }

    /// Whether a provider transaction was already recorded against an invoice
    #[instrument(skip(self), err)]
    pub async fn exists_for_processor_tx(&mut self, invoice_id: InvoiceId, processor_tx_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payments WHERE invoice_id = $1 AND processor_tx_id = $2)")
            .bind(invoice_id)
            .bind(processor_tx_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(exists)
    }
}

pub struct PaymentMeans<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PaymentMeans<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(slug = %request.slug), err)]
    pub async fn create(&mut self, request: &PaymentMeanCreateDBRequest) -> Result<PaymentMeanDBResponse> {
        let mean = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!(
            r#"
            INSERT INTO payment_means (id, service_id, name, slug, credentials, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PAYMENT_MEAN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(&request.name)
        .bind(&request.slug)
        .bind(Json(&request.credentials))
        .bind(request.is_active)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(mean)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn list(&mut self, service_id: ServiceId, active_only: bool) -> Result<Vec<PaymentMeanDBResponse>> {
        let means = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!(
            "SELECT {PAYMENT_MEAN_COLUMNS} FROM payment_means WHERE service_id = $1 AND (NOT $2 OR is_active) ORDER BY name"
        ))
        .bind(service_id)
        .bind(active_only)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(means)
    }

    #[instrument(skip(self), fields(payment_mean_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: PaymentMeanId) -> Result<Option<PaymentMeanDBResponse>> {
        let mean = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!("SELECT {PAYMENT_MEAN_COLUMNS} FROM payment_means WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(mean)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get_by_slug(&mut self, service_id: ServiceId, slug: &str) -> Result<Option<PaymentMeanDBResponse>> {
        let mean = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!(
            "SELECT {PAYMENT_MEAN_COLUMNS} FROM payment_means WHERE service_id = $1 AND slug = $2"
        ))
        .bind(service_id)
        .bind(slug)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(mean)
    }

    /// Flip the active flag and return the updated mean
    #[instrument(skip(self), fields(payment_mean_id = %abbrev_uuid(&id)), err)]
    pub async fn toggle(&mut self, id: PaymentMeanId) -> Result<PaymentMeanDBResponse> {
        let mean = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!(
            "UPDATE payment_means SET is_active = NOT is_active WHERE id = $1 RETURNING {PAYMENT_MEAN_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(mean)
    }

    #[instrument(skip(self, credentials), fields(payment_mean_id = %abbrev_uuid(&id)), err)]
    pub async fn set_credentials(&mut self, id: PaymentMeanId, credentials: &serde_json::Value) -> Result<PaymentMeanDBResponse> {
        let mean = sqlx::query_as::<_, PaymentMeanDBResponse>(&format!(
            "UPDATE payment_means SET credentials = $2 WHERE id = $1 RETURNING {PAYMENT_MEAN_COLUMNS}"
        ))
        .bind(id)
        .bind(Json(credentials))
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_member, create_test_service};
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_payment_mean_toggle_and_credentials(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PaymentMeans::new(&mut conn);

        let mean = repo
            .create(&PaymentMeanCreateDBRequest {
                service_id: service.id,
                name: "MTN Mobile Money".to_string(),
                slug: "mtn-momo".to_string(),
                credentials: json!({}),
                is_active: false,
            })
            .await
            .unwrap();

        let toggled = repo.toggle(mean.id).await.unwrap();
        assert!(toggled.is_active);
        assert_eq!(repo.list(service.id, true).await.unwrap().len(), 1);

        let updated = repo.set_credentials(mean.id, &json!({"api_user": "u"})).await.unwrap();
        assert_eq!(updated.credentials.0["api_user"], "u");

        let duplicate = repo
            .create(&PaymentMeanCreateDBRequest {
                service_id: service.id,
                name: "Again".to_string(),
                slug: "mtn-momo".to_string(),
                credentials: json!({}),
                is_active: true,
            })
            .await;
        assert!(matches!(duplicate, Err(DbError::UniqueViolation { .. })));
    }
}
