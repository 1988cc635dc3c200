//! Database layer for data persistence and access.
//!
//! ```text
//! ┌─────────────┐
//! │  Handlers   │  (API request handlers, jobs)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - queries)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - database records)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │  DbRouter   │  (db::router - default, umbrella, wallets, tenant databases)
//! └─────────────┘
//! ```
//!
//! Repositories are built from a connection or a transaction:
//!
//! ```ignore
//! let mut tx = state.db.begin().await?;
//! let invoice = Invoices::new(&mut tx).add_payment(invoice_id, amount).await?;
//! tx.commit().await?;
//! ```
//!
//! Migrations live in `migrations/` and run through [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;
pub mod router;
