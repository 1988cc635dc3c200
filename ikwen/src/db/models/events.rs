//! Database models for console events and sending reports.

use crate::types::{MemberId, ServiceId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of a console event or sending report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum EventType {
    WelcomeEvent,
    InvoicesSentEvent,
    RemindersSentEvent,
    OverdueNoticesSentEvent,
    SuspensionNoticesSentEvent,
    PaymentConfirmation,
    /// A member's subscription was suspended for an unpaid invoice
    ServiceSuspended,
    /// A member subscribed to one of the tenant's products
    SubscriptionActivated,
    EmptyMessagingCredit,
    LowMessagingCredit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WelcomeEvent => "WelcomeEvent",
            EventType::InvoicesSentEvent => "InvoicesSentEvent",
            EventType::RemindersSentEvent => "RemindersSentEvent",
            EventType::OverdueNoticesSentEvent => "OverdueNoticesSentEvent",
            EventType::SuspensionNoticesSentEvent => "SuspensionNoticesSentEvent",
            EventType::PaymentConfirmation => "PaymentConfirmation",
            EventType::ServiceSuspended => "ServiceSuspended",
            EventType::SubscriptionActivated => "SubscriptionActivated",
            EventType::EmptyMessagingCredit => "EmptyMessagingCredit",
            EventType::LowMessagingCredit => "LowMessagingCredit",
        }
    }
}

/// An entry of a member's console feed
#[derive(Debug, Clone, FromRow)]
pub struct ConsoleEventDBResponse {
    pub id: Uuid,
    pub service_id: ServiceId,
    pub member_id: Option<MemberId>,
    pub event_type: String,
    pub object_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConsoleEventCreateDBRequest {
    pub service_id: ServiceId,
    /// `None` for events addressed to the service staff
    pub member_id: Option<MemberId>,
    pub event_type: EventType,
    pub object_id: Option<Uuid>,
}

/// Summary of a batch of notifications sent by a job
#[derive(Debug, Clone, FromRow)]
pub struct SendingReportDBResponse {
    pub id: Uuid,
    pub service_id: ServiceId,
    pub kind: String,
    pub count: i32,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
}
