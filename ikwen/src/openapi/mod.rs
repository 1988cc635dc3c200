//! OpenAPI documentation configuration.
//!
//! [`api::ApiDoc`] documents the platform API served at `/api/v1/*`, together with the
//! authentication routes and the mobile money webhooks. It is rendered at `/docs`.

pub mod api;

pub use api::ApiDoc;
