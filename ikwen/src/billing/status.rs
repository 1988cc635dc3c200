//! Status machines of invoices, subscriptions and revivals.
//!
//! Status columns are only ever written through [`StatusMachine::transition`], which rejects
//! edges that are not in the entity's transition table with [`Error::InvalidTransition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::errors::Error;

/// A status enum with an explicit table of allowed edges.
pub trait StatusMachine: Copy + PartialEq + fmt::Display + 'static {
    /// Name of the entity in error messages
    const ENTITY: &'static str;

    /// Statuses reachable in one step from `self`
    fn successors(&self) -> &'static [Self];

    fn can_transition_to(&self, to: Self) -> bool {
        self.successors().contains(&to)
    }

    /// Validate a transition and return the new status
    fn transition(self, to: Self) -> Result<Self, Error> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition {
                entity: Self::ENTITY.to_string(),
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Overdue,
    /// Past the tolerance period; the subscription gets suspended
    Exceeded,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Exceeded => "exceeded",
            InvoiceStatus::Paid => "paid",
        }
    }
}

impl StatusMachine for InvoiceStatus {
    const ENTITY: &'static str = "invoice";

    fn successors(&self) -> &'static [Self] {
        match self {
            InvoiceStatus::Pending => &[InvoiceStatus::Overdue, InvoiceStatus::Paid],
            InvoiceStatus::Overdue => &[InvoiceStatus::Exceeded, InvoiceStatus::Paid],
            InvoiceStatus::Exceeded => &[InvoiceStatus::Paid],
            InvoiceStatus::Paid => &[],
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Suspended,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl StatusMachine for SubscriptionStatus {
    const ENTITY: &'static str = "subscription";

    fn successors(&self) -> &'static [Self] {
        match self {
            SubscriptionStatus::Pending => &[SubscriptionStatus::Active, SubscriptionStatus::Canceled],
            SubscriptionStatus::Active => &[
                SubscriptionStatus::Suspended,
                SubscriptionStatus::Canceled,
                SubscriptionStatus::Expired,
            ],
            SubscriptionStatus::Suspended => &[SubscriptionStatus::Active, SubscriptionStatus::Canceled],
            SubscriptionStatus::Expired => &[SubscriptionStatus::Active],
            SubscriptionStatus::Canceled => &[],
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[sqlx(type_name = "revival_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RevivalStatus {
    Pending,
    Started,
    Complete,
}

impl RevivalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevivalStatus::Pending => "pending",
            RevivalStatus::Started => "started",
            RevivalStatus::Complete => "complete",
        }
    }
}

impl StatusMachine for RevivalStatus {
    const ENTITY: &'static str = "revival";

    fn successors(&self) -> &'static [Self] {
        match self {
            RevivalStatus::Pending => &[RevivalStatus::Started],
            RevivalStatus::Started => &[RevivalStatus::Complete],
            RevivalStatus::Complete => &[],
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_as_str!(InvoiceStatus, SubscriptionStatus, RevivalStatus);
