//! Database repository for products.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::products::{ProductCreateDBRequest, ProductDBResponse, ProductUpdateDBRequest},
};
use crate::types::{ProductId, ServiceId, abbrev_uuid};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = "id, service_id, name, short_description, cost, duration, is_active, created_at";

#[derive(Debug, Clone)]
pub struct ProductFilter {
    pub service_id: ServiceId,
    pub active_only: bool,
    pub query: ListQuery,
}

pub struct Products<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Products<'c> {
    type CreateRequest = ProductCreateDBRequest;
    type UpdateRequest = ProductUpdateDBRequest;
    type Response = ProductDBResponse;
    type Id = ProductId;
    type Filter = ProductFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let product = sqlx::query_as::<_, ProductDBResponse>(&format!(
            r#"
            INSERT INTO products (id, service_id, name, short_description, cost, duration, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.service_id)
        .bind(&request.name)
        .bind(&request.short_description)
        .bind(request.cost)
        .bind(request.duration)
        .bind(request.is_active)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(product)
    }

    #[instrument(skip(self), fields(product_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let product = sqlx::query_as::<_, ProductDBResponse>(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(product)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let products = sqlx::query_as::<_, ProductDBResponse>(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(products.into_iter().map(|p| (p.id, p)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let products = sqlx::query_as::<_, ProductDBResponse>(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS} FROM products
            WHERE service_id = $1 AND (NOT $2 OR is_active) AND ($3::text IS NULL OR LOWER(name) LIKE $3)
            ORDER BY cost ASC, name ASC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.service_id)
        .bind(filter.active_only)
        .bind(filter.query.search_pattern())
        .bind(filter.query.limit)
        .bind(filter.query.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(products)
    }

    #[instrument(skip(self), fields(product_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(product_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let product = sqlx::query_as::<_, ProductDBResponse>(&format!(
            r#"
            UPDATE products SET
                name = COALESCE($2, name),
                short_description = COALESCE($3, short_description),
                cost = COALESCE($4, cost),
                duration = COALESCE($5, duration),
                is_active = COALESCE($6, is_active)
            WHERE id = $1
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.short_description)
        .bind(request.cost)
        .bind(request.duration)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(product)
    }
}

impl<'c> Products<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &ProductFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE service_id = $1 AND (NOT $2 OR is_active) AND ($3::text IS NULL OR LOWER(name) LIKE $3)",
        )
        .bind(filter.service_id)
        .bind(filter.active_only)
        .bind(filter.query.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }
}
