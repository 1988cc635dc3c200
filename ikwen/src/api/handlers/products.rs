use crate::api::models::billing::{ListProductsQuery, ProductCreate, ProductResponse, ProductUpdate};
use crate::api::models::members::CurrentUser;
use crate::api::models::pagination::PaginatedResponse;
use crate::auth::permissions::{RequiresPermission, can_read_all_resources, operation, resource};
use crate::db::errors::DbError;
use crate::db::handlers::{Products, Repository, products::ProductFilter};
use crate::db::models::products::{ProductCreateDBRequest, ProductDBResponse, ProductUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{ProductId, Resource, ServiceId};
use crate::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use sqlx::PgConnection;

async fn tenant_product(conn: &mut PgConnection, service_id: ServiceId, product_id: ProductId) -> Result<ProductDBResponse> {
    Products::new(conn)
        .get_by_id(product_id)
        .await?
        .filter(|p| p.service_id == service_id)
        .ok_or_else(|| Error::NotFound {
            resource: "Product".to_string(),
            id: product_id.to_string(),
        })
}

fn validate_pricing(cost: Option<Decimal>, duration: Option<i32>) -> Result<()> {
    if cost.is_some_and(|c| c < Decimal::ZERO) {
        return Err(Error::BadRequest {
            message: "cost cannot be negative".to_string(),
        });
    }
    if duration.is_some_and(|d| d < 1) {
        return Err(Error::BadRequest {
            message: "duration must be at least one day".to_string(),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/products",
    tag = "billing",
    summary = "List products",
    description = "Members without read access to products only see active ones.",
    params(ListProductsQuery),
    responses(
        (status = 200, description = "Products of the current service", body = PaginatedResponse<ProductResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ListProductsQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<ProductResponse>>> {
    let service_id = current_user.tenant()?;
    let list_query = query.to_list_query();
    let filter = ProductFilter {
        service_id,
        active_only: query.active_only || !can_read_all_resources(&current_user, Resource::Products),
        query: list_query.clone(),
    };

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Products::new(&mut conn);
    let products = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        products.into_iter().map(ProductResponse::from).collect(),
        total_count,
        list_query.skip,
        list_query.limit,
    )))
}

#[utoipa::path(
    post,
    path = "/products",
    tag = "billing",
    summary = "Create product",
    request_body = ProductCreate,
    responses(
        (status = 201, description = "Product created", body = ProductResponse),
        (status = 400, description = "Invalid pricing"),
        (status = 403, description = "Forbidden"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_product(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Products, operation::CreateAll>,
    Json(create): Json<ProductCreate>,
) -> Result<(StatusCode, Json<ProductResponse>)> {
    let service_id = current_user.tenant()?;
    let name = create.name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest {
            message: "Product name cannot be empty".to_string(),
        });
    }
    validate_pricing(Some(create.cost), Some(create.duration))?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let product = Products::new(&mut conn)
        .create(&ProductCreateDBRequest {
            service_id,
            name: name.to_string(),
            short_description: create.short_description,
            cost: create.cost,
            duration: create.duration,
            is_active: create.is_active,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ProductResponse::from(product))))
}

#[utoipa::path(
    get,
    path = "/products/{id}",
    tag = "billing",
    summary = "Get product",
    params(("id" = uuid::Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product", body = ProductResponse),
        (status = 404, description = "Product not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
    current_user: CurrentUser,
) -> Result<Json<ProductResponse>> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let product = tenant_product(&mut conn, service_id, id).await?;
    if !product.is_active && !can_read_all_resources(&current_user, Resource::Products) {
        return Err(Error::NotFound {
            resource: "Product".to_string(),
            id: id.to_string(),
        });
    }
    Ok(Json(ProductResponse::from(product)))
}

#[utoipa::path(
    patch,
    path = "/products/{id}",
    tag = "billing",
    summary = "Update product",
    params(("id" = uuid::Uuid, Path, description = "Product ID")),
    request_body = ProductUpdate,
    responses(
        (status = 200, description = "Product updated", body = ProductResponse),
        (status = 400, description = "Invalid pricing"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Product not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
    current_user: RequiresPermission<resource::Products, operation::UpdateAll>,
    Json(update): Json<ProductUpdate>,
) -> Result<Json<ProductResponse>> {
    let service_id = current_user.tenant()?;
    validate_pricing(update.cost, update.duration)?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_product(&mut conn, service_id, id).await?;
    let product = Products::new(&mut conn).update(id, &ProductUpdateDBRequest::from(update)).await?;
    Ok(Json(ProductResponse::from(product)))
}

#[utoipa::path(
    delete,
    path = "/products/{id}",
    tag = "billing",
    summary = "Delete product",
    description = "Subscriptions to the product are kept and keep their cost.",
    params(("id" = uuid::Uuid, Path, description = "Product ID")),
    responses(
        (status = 204, description = "Product deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Product not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
    current_user: RequiresPermission<resource::Products, operation::DeleteAll>,
) -> Result<StatusCode> {
    let service_id = current_user.tenant()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    tenant_product(&mut conn, service_id, id).await?;
    Products::new(&mut conn).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::groups::COMMUNITY_GROUP;
    use crate::test_utils::{add_to_group, authenticated, create_test_member, create_test_service, create_test_state};
    use axum::routing::get;
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    async fn server(pool: PgPool) -> TestServer {
        let state = create_test_state(pool).await;
        let app = axum::Router::new()
            .route("/products", get(list_products).post(create_product))
            .route("/products/{id}", get(get_product).patch(update_product).delete(delete_product))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_staff_manage_products(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Gym").await;
        let server = server(pool).await;

        let created = authenticated(server.post("/products"), &owner, Some(service.id))
            .json(&json!({"name": "Monthly pass", "cost": "15000"}))
            .await;
        created.assert_status(StatusCode::CREATED);
        let product: ProductResponse = created.json();
        assert_eq!(product.duration, 30);
        assert!(product.is_active);

        let updated: ProductResponse = authenticated(server.patch(&format!("/products/{}", product.id)), &owner, Some(service.id))
            .json(&json!({"cost": "12000"}))
            .await
            .json();
        assert_eq!(updated.cost, Decimal::new(12000, 0));

        authenticated(server.patch(&format!("/products/{}", product.id)), &owner, Some(service.id))
            .json(&json!({"duration": 0}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        authenticated(server.delete(&format!("/products/{}", product.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        authenticated(server.get(&format!("/products/{}", product.id)), &owner, Some(service.id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_customers_only_see_active_products(pool: PgPool) {
        let owner = create_test_member(&pool, "owner").await;
        let service = create_test_service(&pool, owner.id, "Gym").await;
        let customer = create_test_member(&pool, "customer").await;
        add_to_group(&pool, service.id, COMMUNITY_GROUP, customer.id).await;
        let server = server(pool).await;

        for (name, active) in [("Day pass", true), ("Legacy pass", false)] {
            authenticated(server.post("/products"), &owner, Some(service.id))
                .json(&json!({"name": name, "cost": "2000", "is_active": active}))
                .await
                .assert_status(StatusCode::CREATED);
        }

        let page: PaginatedResponse<ProductResponse> = authenticated(server.get("/products"), &owner, Some(service.id)).await.json();
        assert_eq!(page.total_count, 2);

        let page: PaginatedResponse<ProductResponse> =
            authenticated(server.get("/products"), &customer, Some(service.id)).await.json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].name, "Day pass");

        authenticated(server.post("/products"), &customer, Some(service.id))
            .json(&json!({"name": "Free pass", "cost": "0"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }
}
