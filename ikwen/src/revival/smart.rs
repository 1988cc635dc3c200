//! Smart revivals: one mail about an object to the members whose profile tags match it.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument, warn};

use super::{MAX_AUTO_REWARDS, MAX_BATCH_SEND, RevivalJobs, RevivalReport, deliverable, personalize_html, stale_before};
use crate::billing::status::RevivalStatus;
use crate::db::{
    errors::DbError,
    handlers::{Revivals, Services, revivals::TargetChunk},
    models::{
        revivals::{RevivalDBResponse, TargetDBResponse},
        services::ConfigDBResponse,
    },
};
use crate::errors::Error;
use crate::notifier::Delivery;
use crate::types::{RevivalId, abbrev_uuid};

/// Reruns wait this long after a revival completes or last reran
const RERUN_DELAY_DAYS: i64 = 3;

/// Outcome of mailing a batch of targets
#[derive(Debug, Default)]
struct Batch {
    sent: i32,
    failures: u32,
    out_of_credit: bool,
}

impl RevivalJobs {
    /// Build the targets of pending revivals, then mail the next batch of every started one
    #[instrument(skip(self), err)]
    pub async fn notify_profiles(&self, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let revivals = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Revivals::new(&mut conn)
                .list_active(&[RevivalStatus::Pending, RevivalStatus::Started])
                .await?
        };
        let mut report = RevivalReport::default();
        for revival in revivals {
            let result = self.exclusively(&revival, now, |jobs, revival| jobs.notify_revival(revival, now)).await;
            report.count(result, &abbrev_uuid(&revival.id));
        }
        Ok(report)
    }

    /// Target members who joined since the last run of started or complete revivals, and mail them
    #[instrument(skip(self), err)]
    pub async fn notify_profiles_retro(&self, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let revivals = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Revivals::new(&mut conn)
                .list_active(&[RevivalStatus::Started, RevivalStatus::Complete])
                .await?
        };
        let mut report = RevivalReport::default();
        for revival in revivals.into_iter().filter(|r| r.run_on.is_some()) {
            let result = self.exclusively(&revival, now, |jobs, revival| jobs.notify_newcomers(revival, now)).await;
            report.count(result, &abbrev_uuid(&revival.id));
        }
        Ok(report)
    }

    /// Mail the targets of complete revivals again, up to [`MAX_AUTO_REWARDS`] times each
    #[instrument(skip(self), err)]
    pub async fn rerun_complete_revivals(&self, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let revivals = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Revivals::new(&mut conn)
                .list_complete_since(now - Duration::days(RERUN_DELAY_DAYS))
                .await?
        };
        let mut report = RevivalReport::default();
        for revival in revivals {
            let result = self.exclusively(&revival, now, |jobs, revival| jobs.rerun_revival(revival, now)).await;
            report.count(result, &abbrev_uuid(&revival.id));
        }
        Ok(report)
    }

    /// Run `job` on `revival` unless another runner holds it, or the tenant has no mail credit.
    /// `None` when the revival was skipped.
    async fn exclusively<'a, F, Fut>(&'a self, revival: &'a RevivalDBResponse, now: DateTime<Utc>, job: F) -> Result<Option<RevivalReport>, Error>
    where
        F: FnOnce(&'a Self, &'a RevivalDBResponse) -> Fut,
        Fut: Future<Output = Result<RevivalReport, Error>> + 'a,
    {
        if self.balance(revival.service_id).await?.mail_count == 0 {
            self.record_empty_credit(revival.service_id, now).await?;
            return Ok(None);
        }
        if !self.claim(revival.id, now).await? {
            debug!(revival_id = %abbrev_uuid(&revival.id), "Revival already running");
            return Ok(None);
        }

        let result = job(self, revival).await;

        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        Revivals::new(&mut conn).release_run(revival.id).await?;
        result.map(Some)
    }

    async fn claim(&self, id: RevivalId, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        Ok(Revivals::new(&mut conn).try_start_run(id, now, stale_before(now)).await?)
    }

    async fn notify_revival(&self, revival: &RevivalDBResponse, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let mut revival = revival.clone();
        if revival.status == RevivalStatus::Pending {
            self.add_targets(&revival, None).await?;
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            let mut repo = Revivals::new(&mut conn);
            let total = repo.count_targets(revival.id).await?;
            repo.transition(revival.id, RevivalStatus::Started).await?;
            revival = repo.mark_run(revival.id, now, total as i32).await?;
            debug!(revival_id = %abbrev_uuid(&revival.id), total, "Revival started");
        }
        self.send_pending(&revival, now).await
    }

    async fn notify_newcomers(&self, revival: &RevivalDBResponse, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let extra = self.add_targets(revival, revival.run_on).await?;
        if extra == 0 {
            return Ok(RevivalReport::default());
        }
        let revival = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            Revivals::new(&mut conn)
                .mark_run(revival.id, now, revival.total + extra as i32)
                .await?
        };
        debug!(revival_id = %abbrev_uuid(&revival.id), extra, "Newcomers targeted");
        self.send_pending(&revival, now).await
    }

    async fn rerun_revival(&self, revival: &RevivalDBResponse, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let (config, targets) = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            let mut repo = Revivals::new(&mut conn);
            repo.mark_run(revival.id, now, revival.total).await?;
            let targets = repo.targets_for_rerun(revival.id, MAX_AUTO_REWARDS, MAX_BATCH_SEND).await?;
            let config = Services::new(&mut conn).get_config(revival.service_id).await?;
            (config, targets)
        };
        let batch = self.mail_targets(revival, &config, &targets, now).await?;
        Ok(RevivalReport {
            mails: batch.sent as u32,
            failures: batch.failures,
            ..Default::default()
        })
    }

    /// Create targets in chunks of [`MAX_BATCH_SEND`] members. Returns how many were created.
    async fn add_targets(&self, revival: &RevivalDBResponse, joined_after: Option<DateTime<Utc>>) -> Result<i64, Error> {
        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut repo = Revivals::new(&mut conn);
        let mut inserted = 0;
        let mut skip = 0;
        loop {
            let TargetChunk { scanned, inserted: created } = repo.add_matching_targets(revival, joined_after, skip, MAX_BATCH_SEND).await?;
            inserted += created;
            if scanned < MAX_BATCH_SEND {
                return Ok(inserted);
            }
            skip += MAX_BATCH_SEND;
        }
    }

    /// Mail the next batch of targets not notified yet and complete the revival once all were
    async fn send_pending(&self, revival: &RevivalDBResponse, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let (config, targets) = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            let targets = Revivals::new(&mut conn).pending_targets(revival.id, MAX_BATCH_SEND).await?;
            let config = Services::new(&mut conn).get_config(revival.service_id).await?;
            (config, targets)
        };
        let batch = self.mail_targets(revival, &config, &targets, now).await?;

        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut repo = Revivals::new(&mut conn);
        let updated = repo.add_progress(revival.id, batch.sent).await?;
        if updated.status == RevivalStatus::Started && updated.progress >= updated.total {
            repo.transition(revival.id, RevivalStatus::Complete).await?;
            debug!(revival_id = %abbrev_uuid(&revival.id), "Revival complete");
        }
        Ok(RevivalReport {
            mails: batch.sent as u32,
            failures: batch.failures,
            ..Default::default()
        })
    }

    /// Mail each target once. A target whose mail went out is marked notified. Stops when the
    /// tenant runs out of mail credit.
    async fn mail_targets(
        &self,
        revival: &RevivalDBResponse,
        config: &ConfigDBResponse,
        targets: &[TargetDBResponse],
        now: DateTime<Utc>,
    ) -> Result<Batch, Error> {
        let wallets = self.db.wallets();
        let mut batch = Batch::default();
        for target in targets {
            let Some(email) = deliverable(target.email.as_deref()) else {
                continue;
            };
            let content = personalize_html(&revival.mail_content, &target.first_name);
            match self
                .notifier
                .send_tenant_mail(&wallets, config, email, Some(&target.first_name), &revival.mail_subject, &content)
                .await
            {
                Ok(Delivery::Sent) => {
                    let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                    Revivals::new(&mut conn).mark_target_notified(revival.id, target.member_id).await?;
                    batch.sent += 1;
                }
                Ok(Delivery::NoCredit) => {
                    batch.out_of_credit = true;
                    break;
                }
                Ok(Delivery::Skipped) => {}
                Err(e) => {
                    warn!(revival_id = %abbrev_uuid(&revival.id), member_id = %abbrev_uuid(&target.member_id), error = %e, "Revival mail not sent");
                    batch.failures += 1;
                }
            }
        }
        if batch.out_of_credit {
            self.record_empty_credit(revival.service_id, now).await?;
        }
        Ok(batch)
    }
}
