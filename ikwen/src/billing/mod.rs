//! Billing: cycles and proration, status machines, invoice numbering and notices, the daily
//! invoicing jobs, and invoice payments.

pub mod cycle;
pub mod invoicing;
pub mod numbering;
pub mod payments;
pub mod status;
pub mod templates;

pub use cycle::{BillingCycle, get_days_count};
pub use invoicing::{Invoicing, JobReport};
pub use payments::Payer;
pub use status::{InvoiceStatus, RevivalStatus, StatusMachine, SubscriptionStatus};
