//! Revival campaigns: mails that bring members back.
//!
//! Smart revivals target the members whose profile tags intersect the tags of an object (a
//! product, a post). Cyclic revivals repeat a mail and an SMS to every member of one tag on a
//! schedule. Both are paid from the tenant's messaging balance and run from the background
//! scheduler. A revival is processed by one runner at a time through its `is_running` flag. A
//! flag claimed more than [`STALE_RUN_MINUTES`] ago is left by a runner that died, and the next
//! pass takes the revival over.

pub mod cyclic;
pub mod schedule;
pub mod smart;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::db::{
    errors::DbError,
    handlers::{MessagingBalances, Repository, Services},
    models::{
        services::{ConfigDBResponse, ServiceDBResponse},
        wallets::MessagingBalanceDBResponse,
    },
    router::DbRouter,
};
use crate::email::escape;
use crate::errors::Error;
use crate::notifier::{Notifier, notify_for_messaging_credit};
use crate::types::{ServiceId, abbrev_uuid};

/// Most messages sent for one revival in one run
pub const MAX_BATCH_SEND: i64 = 500;

/// Most times a smart revival target is mailed
pub const MAX_AUTO_REWARDS: i32 = 5;

/// Age after which a run claim is taken for abandoned
pub const STALE_RUN_MINUTES: i64 = 60;

/// Claims made before this instant are abandoned
pub(crate) fn stale_before(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::minutes(STALE_RUN_MINUTES)
}

/// Placeholder replaced by the member's first name in revival texts
pub const CLIENT_PLACEHOLDER: &str = "$client";

/// What a revival run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct RevivalReport {
    /// Revivals processed
    pub revivals: u32,
    pub mails: u32,
    pub sms: u32,
    /// Messages or revivals that failed
    pub failures: u32,
}

impl RevivalReport {
    pub fn merge(&mut self, other: RevivalReport) {
        self.revivals += other.revivals;
        self.mails += other.mails;
        self.sms += other.sms;
        self.failures += other.failures;
    }

    fn count(&mut self, result: Result<Option<RevivalReport>, Error>, revival: &str) {
        match result {
            Ok(Some(report)) => {
                self.merge(report);
                self.revivals += 1;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(revival, error = %e, "Revival failed");
                self.failures += 1;
            }
        }
    }
}

/// Substitute the member's first name in a mail body
pub(crate) fn personalize_html(content: &str, first_name: &str) -> String {
    content.replace(CLIENT_PLACEHOLDER, &escape(first_name))
}

pub(crate) fn personalize_text(content: &str, first_name: &str) -> String {
    content.replace(CLIENT_PLACEHOLDER, first_name)
}

/// Placeholder addresses are generated for members who registered with a phone only
pub(crate) fn deliverable(email: Option<&str>) -> Option<&str> {
    email.filter(|e| !e.is_empty() && !(e.starts_with("__") && e.ends_with("__@ikwen.com")))
}

/// Runs smart and cyclic revivals
#[derive(Clone)]
pub struct RevivalJobs {
    db: DbRouter,
    notifier: Notifier,
}

impl RevivalJobs {
    pub fn new(db: DbRouter, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// One pass of every revival job
    pub async fn run_all(&self, now: DateTime<Utc>) -> RevivalReport {
        let mut total = RevivalReport::default();
        let jobs = [
            ("notify_profiles", self.notify_profiles(now).await),
            ("notify_profiles_retro", self.notify_profiles_retro(now).await),
            ("rerun_complete_revivals", self.rerun_complete_revivals(now).await),
            ("run_cyclic_revivals", self.run_cyclic_revivals(now).await),
        ];
        for (job, result) in jobs {
            match result {
                Ok(report) => total.merge(report),
                Err(e) => {
                    tracing::error!(job, error = %e, "Revival job failed");
                    total.failures += 1;
                }
            }
        }
        if total != RevivalReport::default() {
            info!(?total, "Revival jobs done");
        }
        total
    }

    async fn tenant(&self, service_id: ServiceId) -> Result<(ServiceDBResponse, ConfigDBResponse), Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut services = Services::new(&mut conn);
        let service = services.get_by_id(service_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Service".to_string(),
            id: service_id.to_string(),
        })?;
        let config = services.get_config(service_id).await?;
        Ok((service, config))
    }

    async fn balance(&self, service_id: ServiceId) -> Result<MessagingBalanceDBResponse, Error> {
        let wallets = self.db.wallets();
        let mut conn = wallets.acquire().await.map_err(DbError::from)?;
        Ok(MessagingBalances::new(&mut conn).get(service_id).await?)
    }

    /// Tell the tenant's owner that revivals ran out of credit. However many of the tenant's
    /// revivals run dry, the owner gets one event a day.
    async fn record_empty_credit(&self, service_id: ServiceId, now: DateTime<Utc>) -> Result<(), Error> {
        let service = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Services::new(&mut conn).get_by_id(service_id).await?
        };
        let Some(service) = service else {
            return Ok(());
        };
        if notify_for_messaging_credit(&self.db, &service, now).await?.is_some() {
            info!(service_id = %abbrev_uuid(&service_id), "Revivals stopped for lack of messaging credit");
        }
        Ok(())
    }
}
