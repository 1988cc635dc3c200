//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Authentication** (`/authentication/*`): registration, login, password recovery
//! - **Core** (`/api/v1/services`, `/api/v1/config`, `/api/v1/events`): services and their configuration
//! - **Access control** (`/api/v1/members`, `/api/v1/groups`): members, staff groups and permissions
//! - **Billing** (`/api/v1/products`, `/api/v1/subscriptions`, `/api/v1/invoices`, `/api/v1/payments/*`)
//! - **Revival** (`/api/v1/profile-tags`, `/api/v1/revivals`, `/api/v1/cyclic-revivals`)
//! - **Webhooks** (`/webhooks/mobile-money/*`): operator notifications
//!
//! All endpoints carry `utoipa` annotations. The reference is served at `/docs`.

pub mod handlers;
pub mod models;
