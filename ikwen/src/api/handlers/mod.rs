//! HTTP request handlers for all API endpoints.
//!
//! Handlers resolve the tenant from the request, check permissions through the
//! [`crate::auth::permissions`] extractors and go through the `db::handlers` repositories.
//! Entities that belong to another service answer 404.
//!
//! # Handler Modules
//!
//! - [`auth`]: registration, login, logout and password management
//! - [`config`]: service configuration and invoicing configuration
//! - [`events`]: console events and messaging reports
//! - [`services`]: service (tenant) CRUD and joining a service
//! - [`members`]: member profile, toggling, group moves and collaborator permissions
//! - [`groups`]: groups and the permissions they grant
//! - [`products`], [`subscriptions`], [`invoices`], [`payment_means`]: billing
//! - [`mobile_money`]: mobile money payments and operator webhooks
//! - [`profile_tags`], [`revivals`], [`cyclic_revivals`]: revival campaigns
//!
//! Handlers return [`crate::errors::Error`], which converts to a status code and a JSON body.

pub mod auth;
pub mod config;
pub mod cyclic_revivals;
pub mod events;
pub mod groups;
pub mod invoices;
pub mod members;
pub mod mobile_money;
pub mod payment_means;
pub mod products;
pub mod profile_tags;
pub mod revivals;
pub mod services;
pub mod subscriptions;
