//! Invoice numbers.
//!
//! Numbers generated by the invoicing jobs start with `A`, numbers of invoices created by staff
//! start with `M`, so both can be issued concurrently without colliding. Two invoices of the same
//! prefix created at once may still draw the same count. The loser hits the unique number
//! constraint and numbers again, see [`is_number_collision`].

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::db::{
    errors::{DbError, Result},
    handlers::Invoices,
};
use crate::types::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberPrefix {
    Auto,
    Manual,
}

impl NumberPrefix {
    fn letter(self) -> char {
        match self {
            NumberPrefix::Auto => 'A',
            NumberPrefix::Manual => 'M',
        }
    }
}

/// `{prefix}{sequence}/{MMYY}`
pub fn format_invoice_number(prefix: NumberPrefix, sequence: i64, at: DateTime<Utc>) -> String {
    format!("{}{}/{}", prefix.letter(), sequence, at.format("%m%y"))
}

/// Numbering tries before a collision is reported to the caller
pub const NUMBERING_ATTEMPTS: u32 = 5;

/// Whether `error` is another invoice of the tenant taking the same number
pub fn is_number_collision(error: &DbError) -> bool {
    matches!(error, DbError::UniqueViolation { constraint: Some(c), .. } if c == "invoices_service_number_key")
}

/// Next number for a tenant: its invoice count plus one
pub async fn next_invoice_number(db: &mut PgConnection, service_id: ServiceId, prefix: NumberPrefix, at: DateTime<Utc>) -> Result<String> {
    let count = Invoices::new(db).count_for_service(service_id).await?;
    Ok(format_invoice_number(prefix, count + 1, at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_number_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        assert_eq!(format_invoice_number(NumberPrefix::Auto, 1000, at), "A1000/0324");
        assert_eq!(format_invoice_number(NumberPrefix::Manual, 7, at), "M7/0324");
    }

    #[test]
    fn test_number_collision() {
        let collision = DbError::UniqueViolation {
            constraint: Some("invoices_service_number_key".to_string()),
            table: Some("invoices".to_string()),
            message: "duplicate key".to_string(),
        };
        assert!(is_number_collision(&collision));
        let other = DbError::UniqueViolation {
            constraint: Some("members_username_key".to_string()),
            table: Some("members".to_string()),
            message: "duplicate key".to_string(),
        };
        assert!(!is_number_collision(&other));
        assert!(!is_number_collision(&DbError::NotFound));
    }
}
