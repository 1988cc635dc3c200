//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection or transaction and returns models from
//! [`crate::db::models`]. Entities with a plain CRUD surface implement the [`Repository`]
//! trait; status columns only change through the repository's `transition` method.
//!
//! # Available Repositories
//!
//! - [`Members`]: member accounts, ghosts and community listing
//! - [`Groups`]: groups, memberships and permissions
//! - [`Services`]: tenants with their config and invoicing config
//! - [`PasswordResetTokens`]: password reset token lifecycle
//! - [`Events`]: console events, sending reports and queued SMS
//! - [`Products`], [`Subscriptions`], [`Invoices`], [`Payments`], [`PaymentMeans`]: billing
//! - [`MoMoTransactions`]: mobile money transactions
//! - [`OperatorWallets`], [`MessagingBalances`]: the `wallets` database
//! - [`ProfileTags`], [`Revivals`], [`CyclicRevivals`]: revival campaigns
//!
//! ```ignore
//! use ikwen::db::handlers::{Members, Repository};
//!
//! let mut tx = pool.begin().await?;
//! let member = Members::new(&mut tx).get_by_username("jdoe").await?;
//! tx.commit().await?;
//! ```

pub mod cyclic_revivals;
pub mod events;
pub mod groups;
pub mod invoices;
pub mod members;
pub mod mobile_money;
pub mod password_reset_tokens;
pub mod payments;
pub mod products;
pub mod profile_tags;
pub mod repository;
pub mod revivals;
pub mod services;
pub mod subscriptions;
pub mod wallets;

pub use cyclic_revivals::CyclicRevivals;
pub use events::Events;
pub use groups::Groups;
pub use invoices::Invoices;
pub use members::Members;
pub use mobile_money::MoMoTransactions;
pub use password_reset_tokens::PasswordResetTokens;
pub use payments::{PaymentMeans, Payments};
pub use products::Products;
pub use profile_tags::ProfileTags;
pub use repository::Repository;
pub use revivals::Revivals;
pub use services::Services;
pub use subscriptions::Subscriptions;
pub use wallets::{MessagingBalances, OperatorWallets};
