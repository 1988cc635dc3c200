//! API request and response data models.
//!
//! API models are distinct from the `db::models` records so storage can change without
//! breaking clients. Everything here derives `utoipa::ToSchema`.
//!
//! - [`auth`]: registration, login and password payloads
//! - [`members`], [`groups`]: members, groups and permission grants
//! - [`services`]: services, configuration, events and sending reports
//! - [`billing`]: products, subscriptions, invoices, payments and mobile money transactions
//! - [`revivals`]: profile tags, revivals and cyclic revivals
//! - [`pagination`]: query parameters and the paginated envelope

pub mod auth;
pub mod billing;
pub mod groups;
pub mod members;
pub mod pagination;
pub mod revivals;
pub mod services;
