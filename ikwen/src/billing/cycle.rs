//! Billing cycles and proration.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Period covered by one invoice of a recurring subscription
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "billing_cycle", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    BiAnnually,
    Yearly,
}

impl BillingCycle {
    pub const ALL: [BillingCycle; 4] = [
        BillingCycle::Monthly,
        BillingCycle::Quarterly,
        BillingCycle::BiAnnually,
        BillingCycle::Yearly,
    ];

    /// Number of months billed per cycle
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Quarterly => 3,
            BillingCycle::BiAnnually => 6,
            BillingCycle::Yearly => 12,
        }
    }

    /// Number of days covered by a cycle
    pub fn days(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Quarterly => 91,
            BillingCycle::BiAnnually => 182,
            BillingCycle::Yearly => 365,
        }
    }

    /// Reverse mapping used when an invoice covers a whole number of cycles
    pub fn from_months(months: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|cycle| cycle.months() == months)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::BiAnnually => "bi_annually",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of days a payment covering `months` months extends a subscription by.
///
/// Each completed quarter of a year earns one extra day so that 12 months map onto a real year,
/// and the yearly bonus carries over to the following months.
pub fn get_days_count(months: u32) -> i64 {
    let m = i64::from(months);
    match months {
        0..3 => m * 30,
        3..6 => m * 30 + 1,
        6..9 => m * 30 + 2,
        9..12 => m * 30 + 3,
        12..15 => 365 + (m % 12) * 30,
        15..18 => 366 + (m % 12) * 30,
        18..21 => 367 + (m % 12) * 30,
        21..24 => 368 + (m % 12) * 30,
        _ => 730 + (m % 12) * 30,
    }
}
