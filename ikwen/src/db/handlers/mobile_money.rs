//! Database repository for mobile money transactions.

use crate::db::{
    errors::{DbError, Result},
    models::mobile_money::{TransactionCreateDBRequest, TransactionDBResponse, TransactionSettlement, TransactionStatus},
};
use crate::types::{TransactionId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "id, service_id, provider, wallet, phone, amount, model, object_id, processor_tx_id, task_id, \
     callback, message, is_running, status, created_at, updated_at";

pub struct MoMoTransactions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> MoMoTransactions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Open a transaction in the running state. A second live attempt on the same billed object
    /// fails with a unique violation.
    #[instrument(skip(self, request), fields(provider = %request.provider, object_id = %abbrev_uuid(&request.object_id)), err)]
    pub async fn create(&mut self, request: &TransactionCreateDBRequest) -> Result<TransactionDBResponse> {
        let transaction = sqlx::query_as::<_, TransactionDBResponse>(&format!(
            r#"
            INSERT INTO momo_transactions (id, service_id, provider, wallet, phone, amount, model, object_id, callback)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(&request.provider)
        .bind(&request.wallet)
        .bind(&request.phone)
        .bind(request.amount)
        .bind(&request.model)
        .bind(request.object_id)
        .bind(&request.callback)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(transaction)
    }

    #[instrument(skip(self), fields(transaction_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: TransactionId) -> Result<Option<TransactionDBResponse>> {
        let transaction =
            sqlx::query_as::<_, TransactionDBResponse>(&format!("SELECT {TRANSACTION_COLUMNS} FROM momo_transactions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(transaction)
    }

    #[instrument(skip(self), fields(object_id = %abbrev_uuid(&object_id)), err)]
    pub async fn get_running_for_object(&mut self, model: &str, object_id: Uuid) -> Result<Option<TransactionDBResponse>> {
        let transaction = sqlx::query_as::<_, TransactionDBResponse>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM momo_transactions WHERE model = $1 AND object_id = $2 AND is_running"
        ))
        .bind(model)
        .bind(object_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(transaction)
    }

    /// Running transactions created before `before`, used to resume polling after a restart
    #[instrument(skip(self), err)]
    pub async fn list_running(&mut self, before: DateTime<Utc>) -> Result<Vec<TransactionDBResponse>> {
        let transactions = sqlx::query_as::<_, TransactionDBResponse>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM momo_transactions WHERE is_running AND created_at < $1 ORDER BY created_at"
        ))
        .bind(before)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(transactions)
    }

    /// Store the provider handle (MTN reference id, Orange pay token) used to poll the transaction,
    /// and the provider's own transaction id when it is known at submission
    #[instrument(skip(self), fields(transaction_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_submitted(&mut self, id: TransactionId, task_id: &str, processor_tx_id: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE momo_transactions SET task_id = $2, processor_tx_id = COALESCE($3, processor_tx_id), updated_at = NOW() \
             WHERE id = $1 AND is_running",
        )
        .bind(id)
        .bind(task_id)
        .bind(processor_tx_id)
        .execute(&mut *self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Attach a diagnostic to a settled transaction, e.g. a failure of the settlement callback
    #[instrument(skip(self, message), fields(transaction_id = %abbrev_uuid(&id)), err)]
    pub async fn set_message(&mut self, id: TransactionId, message: &str) -> Result<()> {
        sqlx::query("UPDATE momo_transactions SET message = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Leave the running state with a final status. Returns `None` if the transaction was
    /// already settled, so each transaction is settled exactly once.
    #[instrument(skip(self, settlement), fields(transaction_id = %abbrev_uuid(&id), status = %settlement.status), err)]
    pub async fn settle(&mut self, id: TransactionId, settlement: &TransactionSettlement) -> Result<Option<TransactionDBResponse>> {
        let transaction = sqlx::query_as::<_, TransactionDBResponse>(&format!(
            r#"
            UPDATE momo_transactions SET
                status = $2,
                processor_tx_id = COALESCE($3, processor_tx_id),
                message = $4,
                is_running = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND is_running
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(settlement.status)
        .bind(&settlement.processor_tx_id)
        .bind(&settlement.message)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(transaction)
    }

    /// Final status of a transaction, `Pending` while it runs
    #[instrument(skip(self), fields(transaction_id = %abbrev_uuid(&id)), err)]
    pub async fn status(&mut self, id: TransactionId) -> Result<TransactionStatus> {
        let status: Option<TransactionStatus> = sqlx::query_scalar("SELECT status FROM momo_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        status.ok_or(DbError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::mobile_money::INVOICE_MODEL;
    use crate::test_utils::{create_test_member, create_test_service};
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    fn request(service_id: Uuid, object_id: Uuid) -> TransactionCreateDBRequest {
        TransactionCreateDBRequest {
            service_id,
            provider: "mtn-momo".to_string(),
            wallet: "mtn-momo".to_string(),
            phone: "677000000".to_string(),
            amount: Decimal::from(2_500),
            model: INVOICE_MODEL.to_string(),
            object_id,
            callback: "invoice_paid".to_string(),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_settles_exactly_once(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = MoMoTransactions::new(&mut conn);

        let tx = repo.create(&request(service.id, Uuid::new_v4())).await.unwrap();
        assert!(tx.is_running);
        assert_eq!(tx.status, TransactionStatus::Pending);

        let settlement = TransactionSettlement {
            status: TransactionStatus::Success,
            processor_tx_id: Some("FT-1".to_string()),
            message: None,
        };
        let first = repo.settle(tx.id, &settlement).await.unwrap();
        assert!(first.is_some_and(|t| !t.is_running && t.processor_tx_id.as_deref() == Some("FT-1")));

        let second = repo
            .settle(
                tx.id,
                &TransactionSettlement {
                    status: TransactionStatus::Failure,
                    processor_tx_id: None,
                    message: Some("late".to_string()),
                },
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(repo.status(tx.id).await.unwrap(), TransactionStatus::Success);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_one_running_attempt_per_object(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = MoMoTransactions::new(&mut conn);
        let object_id = Uuid::new_v4();

        let tx = repo.create(&request(service.id, object_id)).await.unwrap();
        assert!(matches!(
            repo.create(&request(service.id, object_id)).await,
            Err(DbError::UniqueViolation { .. })
        ));

        repo.settle(
            tx.id,
            &TransactionSettlement {
                status: TransactionStatus::Timeout,
                processor_tx_id: None,
                message: None,
            },
        )
        .await
        .unwrap();
        assert!(repo.create(&request(service.id, object_id)).await.is_ok());
    }
}
