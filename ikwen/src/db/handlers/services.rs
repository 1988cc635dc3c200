//! Database repository for services (tenants), their config and invoicing config.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::{
        groups::Groups,
        repository::{ListQuery, Repository},
    },
    models::{
        groups::SUDO_GROUP,
        services::{
            ConfigDBResponse, ConfigUpdateDBRequest, InvoicingConfigDBResponse, InvoicingConfigUpdateDBRequest, ServiceCreateDBRequest,
            ServiceDBResponse, ServiceStatus, ServiceUpdateDBRequest,
        },
    },
};
use crate::types::{MemberId, ServiceId, abbrev_uuid};
use sqlx::{Connection, PgConnection};
use tracing::instrument;
use uuid::Uuid;

const SERVICE_COLUMNS: &str = "id, member_id, project_name, project_name_slug, database, domain, url, api_signature, \
     billing_cycle, version, status, monthly_cost, expiry, since";

const CONFIG_COLUMNS: &str = "service_id, company_name, contact_email, currency_code, currency_symbol, decimal_precision, \
     sms_sending_method, sms_api_script_url, sms_label, register_with_email, signature, updated_at";

const INVOICING_CONFIG_COLUMNS: &str = "service_id, gap, tolerance, reminder_delay, overdue_delay, separate_billing_cycle, \
     processing_fees_on_customer, new_invoice_subject, new_invoice_message, reminder_subject, reminder_message, \
     overdue_subject, overdue_message, payment_confirmation_subject, payment_confirmation_message, \
     service_suspension_subject, service_suspension_message, pull_invoice, suspension_return_url";

/// Turn a project name into the unique slug of a service: lower-cased ASCII alphanumerics
/// separated by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Filter for listing services
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub member_id: Option<MemberId>,
    pub status: Option<ServiceStatus>,
    pub query: ListQuery,
}

pub struct Services<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Services<'c> {
    type CreateRequest = ServiceCreateDBRequest;
    type UpdateRequest = ServiceUpdateDBRequest;
    type Response = ServiceDBResponse;
    type Id = ServiceId;
    type Filter = ServiceFilter;

    /// Creates the service together with its config, its invoicing config and its reserved
    /// groups. The owner becomes an IAO and joins `Sudo`.
    #[instrument(skip(self, request), fields(project_name = %request.project_name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let mut tx = self.db.begin().await?;

        let service = sqlx::query_as::<_, ServiceDBResponse>(&format!(
            r#"
            INSERT INTO services (id, member_id, project_name, project_name_slug, database, domain, url, api_signature,
                billing_cycle, version, status, monthly_cost, expiry)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {SERVICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.member_id)
        .bind(&request.project_name)
        .bind(&request.project_name_slug)
        .bind(&request.database)
        .bind(&request.domain)
        .bind(&request.url)
        .bind(&request.api_signature)
        .bind(request.billing_cycle)
        .bind(request.version)
        .bind(request.status)
        .bind(request.monthly_cost)
        .bind(request.expiry)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO configs (service_id, company_name, contact_email) VALUES ($1, $2, $3)")
            .bind(service.id)
            .bind(&request.company_name)
            .bind(&request.contact_email)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO invoicing_configs (service_id) VALUES ($1)")
            .bind(service.id)
            .execute(&mut *tx)
            .await?;

        {
            let mut groups = Groups::new(&mut tx);
            groups.create_reserved(service.id).await?;
            groups.add_member_to_named(service.id, SUDO_GROUP, request.member_id).await?;
        }

        sqlx::query("UPDATE members SET is_iao = TRUE, is_staff = TRUE WHERE id = $1")
            .bind(request.member_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(service)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let service = sqlx::query_as::<_, ServiceDBResponse>(&format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(service)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let services = sqlx::query_as::<_, ServiceDBResponse>(&format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(services.into_iter().map(|s| (s.id, s)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let services = sqlx::query_as::<_, ServiceDBResponse>(&format!(
            r#"
            SELECT {SERVICE_COLUMNS} FROM services
            WHERE ($1::uuid IS NULL OR member_id = $1)
              AND ($2::service_status IS NULL OR status = $2)
              AND ($3::text IS NULL OR LOWER(project_name) LIKE $3)
            ORDER BY since DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.member_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(services)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM services WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(service_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let service = sqlx::query_as::<_, ServiceDBResponse>(&format!(
            r#"
            UPDATE services SET
                project_name = COALESCE($2, project_name),
                domain = COALESCE($3, domain),
                url = COALESCE($4, url),
                billing_cycle = COALESCE($5, billing_cycle),
                version = COALESCE($6, version),
                status = COALESCE($7, status),
                monthly_cost = COALESCE($8, monthly_cost),
                expiry = COALESCE($9, expiry)
            WHERE id = $1
            RETURNING {SERVICE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.project_name)
        .bind(&request.domain)
        .bind(&request.url)
        .bind(request.billing_cycle)
        .bind(request.version)
        .bind(request.status)
        .bind(request.monthly_cost)
        .bind(request.expiry)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(service)
    }
}

impl<'c> Services<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &ServiceFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM services
            WHERE ($1::uuid IS NULL OR member_id = $1)
              AND ($2::service_status IS NULL OR status = $2)
              AND ($3::text IS NULL OR LOWER(project_name) LIKE $3)
            "#,
        )
        .bind(filter.member_id)
        .bind(filter.status)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Services billed by the daily invoicing jobs
    #[instrument(skip(self), err)]
    pub async fn list_active(&mut self) -> Result<Vec<ServiceDBResponse>> {
        let services = sqlx::query_as::<_, ServiceDBResponse>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE status = 'active' ORDER BY since"
        ))
        .fetch_all(&mut *self.db)
        .await?;
        Ok(services)
    }

    /// Database aliases used by services, registered with the router on startup
    #[instrument(skip(self), err)]
    pub async fn database_names(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT DISTINCT database FROM services ORDER BY database")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(names)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_slug(&mut self, slug: &str) -> Result<Option<ServiceDBResponse>> {
        let service = sqlx::query_as::<_, ServiceDBResponse>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE project_name_slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(service)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get_config(&mut self, service_id: ServiceId) -> Result<ConfigDBResponse> {
        let config = sqlx::query_as::<_, ConfigDBResponse>(&format!("SELECT {CONFIG_COLUMNS} FROM configs WHERE service_id = $1"))
            .bind(service_id)
            .fetch_optional(&mut *self.db)
            .await?
            .ok_or(DbError::NotFound)?;
        Ok(config)
    }

    #[instrument(skip(self, request), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn update_config(&mut self, service_id: ServiceId, request: &ConfigUpdateDBRequest) -> Result<ConfigDBResponse> {
        let config = sqlx::query_as::<_, ConfigDBResponse>(&format!(
            r#"
            UPDATE configs SET
                company_name = COALESCE($2, company_name),
                contact_email = COALESCE($3, contact_email),
                currency_code = COALESCE($4, currency_code),
                currency_symbol = COALESCE($5, currency_symbol),
                decimal_precision = COALESCE($6, decimal_precision),
                sms_sending_method = COALESCE($7, sms_sending_method),
                sms_api_script_url = COALESCE($8, sms_api_script_url),
                sms_label = COALESCE($9, sms_label),
                register_with_email = COALESCE($10, register_with_email),
                signature = COALESCE($11, signature),
                updated_at = NOW()
            WHERE service_id = $1
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(service_id)
        .bind(&request.company_name)
        .bind(&request.contact_email)
        .bind(&request.currency_code)
        .bind(&request.currency_symbol)
        .bind(request.decimal_precision)
        .bind(request.sms_sending_method)
        .bind(&request.sms_api_script_url)
        .bind(&request.sms_label)
        .bind(request.register_with_email)
        .bind(&request.signature)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(config)
    }

    #[instrument(skip(self), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn get_invoicing_config(&mut self, service_id: ServiceId) -> Result<InvoicingConfigDBResponse> {
        let config = sqlx::query_as::<_, InvoicingConfigDBResponse>(&format!(
            "SELECT {INVOICING_CONFIG_COLUMNS} FROM invoicing_configs WHERE service_id = $1"
        ))
        .bind(service_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(config)
    }

    #[instrument(skip(self, request), fields(service_id = %abbrev_uuid(&service_id)), err)]
    pub async fn update_invoicing_config(
        &mut self,
        service_id: ServiceId,
        request: &InvoicingConfigUpdateDBRequest,
    ) -> Result<InvoicingConfigDBResponse> {
        let config = sqlx::query_as::<_, InvoicingConfigDBResponse>(&format!(
            r#"
            UPDATE invoicing_configs SET
                gap = COALESCE($2, gap),
                tolerance = COALESCE($3, tolerance),
                reminder_delay = COALESCE($4, reminder_delay),
                overdue_delay = COALESCE($5, overdue_delay),
                separate_billing_cycle = COALESCE($6, separate_billing_cycle),
                processing_fees_on_customer = COALESCE($7, processing_fees_on_customer),
                new_invoice_subject = COALESCE($8, new_invoice_subject),
                new_invoice_message = COALESCE($9, new_invoice_message),
                reminder_subject = COALESCE($10, reminder_subject),
                reminder_message = COALESCE($11, reminder_message),
                overdue_subject = COALESCE($12, overdue_subject),
                overdue_message = COALESCE($13, overdue_message),
                payment_confirmation_subject = COALESCE($14, payment_confirmation_subject),
                payment_confirmation_message = COALESCE($15, payment_confirmation_message),
                service_suspension_subject = COALESCE($16, service_suspension_subject),
                service_suspension_message = COALESCE($17, service_suspension_message),
                pull_invoice = COALESCE($18, pull_invoice),
                suspension_return_url = COALESCE($19, suspension_return_url)
            WHERE service_id = $1
            RETURNING {INVOICING_CONFIG_COLUMNS}
            "#
        ))
        .bind(service_id)
        .bind(request.gap)
        .bind(request.tolerance)
        .bind(request.reminder_delay)
        .bind(request.overdue_delay)
        .bind(request.separate_billing_cycle)
        .bind(request.processing_fees_on_customer)
        .bind(&request.new_invoice_subject)
        .bind(&request.new_invoice_message)
        .bind(&request.reminder_subject)
        .bind(&request.reminder_message)
        .bind(&request.overdue_subject)
        .bind(&request.overdue_message)
        .bind(&request.payment_confirmation_subject)
        .bind(&request.payment_confirmation_message)
        .bind(&request.service_suspension_subject)
        .bind(&request.service_suspension_message)
        .bind(request.pull_invoice)
        .bind(&request.suspension_return_url)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Members;
    use crate::test_utils::{create_test_member, create_test_service};
    use sqlx::PgPool;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Kakocase Shop"), "kakocase-shop");
        assert_eq!(slugify("  Ma Boutique!! 2 "), "ma-boutique-2");
        assert_eq!(slugify("--x--"), "x");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_service_sets_up_tenant(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Kakocase").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Services::new(&mut conn);

        let config = repo.get_config(service.id).await.unwrap();
        assert_eq!(config.currency_code, "XAF");
        let invoicing = repo.get_invoicing_config(service.id).await.unwrap();
        assert_eq!((invoicing.gap, invoicing.tolerance, invoicing.reminder_delay, invoicing.overdue_delay), (15, 1, 5, 2));

        let groups = Groups::new(&mut conn).member_groups(service.id, owner.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, SUDO_GROUP);

        let owner = Members::new(&mut conn).get_by_id(owner.id).await.unwrap().unwrap();
        assert!(owner.is_iao);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_invoicing_config(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Kakocase").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Services::new(&mut conn);
        let updated = repo
            .update_invoicing_config(
                service.id,
                &InvoicingConfigUpdateDBRequest {
                    gap: Some(10),
                    reminder_subject: Some("Pay up".into()),
                    pull_invoice: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.gap, 10);
        assert_eq!(updated.tolerance, 1);
        assert_eq!(updated.reminder_subject, "Pay up");
        assert!(updated.pull_invoice);
        assert_eq!(updated.suspension_return_url, "");
    }
}
