//! Authentication and authorization.
//!
//! Members log in with a username (or email) and a password and receive a JWT session in an
//! HTTP-only cookie. The same token is accepted as an `Authorization: Bearer` header for
//! scripted clients. Every request is made for one tenant, named by the `X-Ikwen-Service` header
//! or the configured default service.
//!
//! # Authorization
//!
//! Permissions are `(resource, operation)` pairs scoped to a tenant. The owner of a service
//! and its `Sudo` staff hold all of them. Other staff hold the union of the permissions of their
//! groups and their collaborator grants. See [`permissions`].
//!
//! # Modules
//!
//! - [`current_user`]: Extractors for the authenticated member and the request's tenant
//! - [`password`]: Password hashing with Argon2 and the password policy
//! - [`permissions`]: Permission checks and the `RequiresPermission` extractor
//! - [`session`]: JWT sessions and their cookie
//! - [`utils`]: Username, phone and name normalization
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use ikwen::auth::permissions::{RequiresPermission, operation, resource};
//!
//! async fn list_products(
//!     State(state): State<AppState>,
//!     current_user: RequiresPermission<resource::Products, operation::ReadAll>,
//! ) -> Result<Json<Vec<ProductResponse>>, Error> {
//!     let service_id = current_user.tenant()?;
//!     // ...
//! }
//! ```

pub mod current_user;
pub mod password;
pub mod permissions;
pub mod session;
pub mod utils;
