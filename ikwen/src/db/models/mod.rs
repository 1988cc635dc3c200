//! Database record models matching table schemas.
//!
//! Each module holds the `*DBRequest` structs accepted by a repository and the `*DBResponse`
//! rows it returns. Response rows derive `sqlx::FromRow`. API models convert from them with
//! `From` impls, so storage and wire representations can evolve independently.
//!
//! # Model Categories
//!
//! ## Access control
//!
//! - [`members`]: member accounts
//! - [`groups`]: groups, memberships and `(resource, operation)` grants
//! - [`password_reset_tokens`]: time-limited password reset secrets
//!
//! ## Core
//!
//! - [`services`]: tenants, their config and invoicing config
//! - [`events`]: console events and job sending reports
//!
//! ## Billing
//!
//! - [`products`], [`subscriptions`], [`invoices`], [`payments`]
//! - [`mobile_money`]: mobile money transactions
//! - [`wallets`]: operator wallets and messaging balances
//!
//! ## Revival
//!
//! - [`revivals`]: profile tags, smart and cyclic revivals and their targets

pub mod events;
pub mod groups;
pub mod invoices;
pub mod members;
pub mod mobile_money;
pub mod password_reset_tokens;
pub mod payments;
pub mod products;
pub mod revivals;
pub mod services;
pub mod subscriptions;
pub mod wallets;
