//! Cyclic revivals: a mail and an SMS repeated on a schedule to every member of a tag.

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, instrument, warn};

use super::{MAX_BATCH_SEND, RevivalJobs, RevivalReport, deliverable, personalize_html, personalize_text, schedule::next_run_date, stale_before};
use crate::db::{
    errors::DbError,
    handlers::{CyclicRevivals, Repository},
    models::revivals::{CyclicRevivalDBResponse, CyclicRevivalUpdateDBRequest},
};
use crate::errors::Error;
use crate::notifier::Delivery;
use crate::types::abbrev_uuid;

impl RevivalJobs {
    /// Send the cyclic revivals planned for the current day and hour
    #[instrument(skip(self), err)]
    pub async fn run_cyclic_revivals(&self, now: DateTime<Utc>) -> Result<RevivalReport, Error> {
        let today = now.date_naive();
        let due = {
            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            CyclicRevivals::new(&mut conn).list_due(today, now.hour() as i32).await?
        };

        let mut report = RevivalReport::default();
        for revival in due {
            let claimed = {
                let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                CyclicRevivals::new(&mut conn).try_start_run(revival.id, now, stale_before(now)).await?
            };
            if !claimed {
                debug!(cyclic_revival_id = %abbrev_uuid(&revival.id), "Cyclic revival already running");
                continue;
            }

            let result = self.run_cyclic(&revival, now).await;

            let mut conn = self.db.acquire().await.map_err(DbError::from)?;
            // A deleted revival has no flag left to release
            CyclicRevivals::new(&mut conn).release_run(revival.id).await?;
            report.count(result, &abbrev_uuid(&revival.id));
        }
        Ok(report)
    }

    async fn run_cyclic(&self, revival: &CyclicRevivalDBResponse, now: DateTime<Utc>) -> Result<Option<RevivalReport>, Error> {
        let balance = self.balance(revival.service_id).await?;
        if balance.mail_count == 0 && balance.sms_count == 0 {
            self.record_empty_credit(revival.service_id, now).await?;
            return Ok(None);
        }

        let mut conn = self.db.acquire().await.map_err(DbError::from)?;
        let mut repo = CyclicRevivals::new(&mut conn);
        let Some(tag_id) = revival.profile_tag_id else {
            info!(cyclic_revival_id = %abbrev_uuid(&revival.id), "Profile tag gone, deleting cyclic revival");
            repo.delete(revival.id).await?;
            return Ok(None);
        };

        let added = repo.add_tag_targets(revival.id, tag_id).await?;
        match next_run_date(revival) {
            Some(next) => repo.set_next_run_on(revival.id, next).await?,
            None => {
                warn!(cyclic_revival_id = %abbrev_uuid(&revival.id), "Cyclic revival has no recurrence, deactivating");
                repo.update(
                    revival.id,
                    &CyclicRevivalUpdateDBRequest {
                        is_active: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }
        drop(conn);
        debug!(cyclic_revival_id = %abbrev_uuid(&revival.id), added, "Cyclic targets built");

        let (_, config) = self.tenant(revival.service_id).await?;
        let wallets = self.db.wallets();
        let mut report = RevivalReport::default();
        let mut mail_exhausted = revival.mail_content.is_empty() || balance.mail_count == 0;
        let mut sms_exhausted = revival.sms_text.is_empty() || balance.sms_count == 0;
        let mut skip = 0;

        'pages: loop {
            let targets = {
                let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                CyclicRevivals::new(&mut conn).targets(revival.id, skip, MAX_BATCH_SEND).await?
            };
            for target in &targets {
                if mail_exhausted && sms_exhausted {
                    break 'pages;
                }
                let mut reached = false;

                if !mail_exhausted && let Some(email) = deliverable(target.email.as_deref()) {
                    let content = personalize_html(&revival.mail_content, &target.first_name);
                    match self
                        .notifier
                        .send_tenant_mail(&wallets, &config, email, Some(&target.first_name), &revival.mail_subject, &content)
                        .await
                    {
                        Ok(Delivery::Sent) => {
                            report.mails += 1;
                            reached = true;
                        }
                        Ok(Delivery::NoCredit) => mail_exhausted = true,
                        Ok(Delivery::Skipped) => {}
                        Err(e) => {
                            warn!(member_id = %abbrev_uuid(&target.member_id), error = %e, "Cyclic revival mail not sent");
                            report.failures += 1;
                        }
                    }
                }

                if !sms_exhausted && let Some(phone) = target.phone.as_deref() {
                    let text = personalize_text(&revival.sms_text, &target.first_name);
                    match self.notifier.send_tenant_sms(&self.db, &wallets, &config, phone, &text).await {
                        Ok(Delivery::Sent) => {
                            report.sms += 1;
                            reached = true;
                        }
                        Ok(Delivery::NoCredit) => sms_exhausted = true,
                        // The tenant does not send SMS
                        Ok(Delivery::Skipped) => sms_exhausted = true,
                        Err(e) => {
                            warn!(member_id = %abbrev_uuid(&target.member_id), error = %e, "Cyclic revival SMS not sent");
                            report.failures += 1;
                        }
                    }
                }

                if reached {
                    let mut conn = self.db.acquire().await.map_err(DbError::from)?;
                    CyclicRevivals::new(&mut conn).record_reached(revival.id, target.member_id).await?;
                }
            }
            if (targets.len() as i64) < MAX_BATCH_SEND {
                break;
            }
            skip += MAX_BATCH_SEND;
        }

        if mail_exhausted && sms_exhausted {
            self.record_empty_credit(revival.service_id, now).await?;
        }
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::{Events, MessagingBalances, ProfileTags};
    use crate::db::models::events::EventType;
    use crate::db::models::revivals::{CyclicRevivalCreateDBRequest, ProfileTagCreateDBRequest};
    use crate::db::router::DbRouter;
    use crate::test_utils::{create_test_member, create_test_notifier, create_test_service};
    use crate::types::ServiceId;
    use chrono::{Duration, NaiveDate, TimeZone};
    use sqlx::PgPool;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 15, 0).unwrap()
    }

    struct Seed {
        service_id: ServiceId,
        tag_id: crate::types::ProfileTagId,
        revival: CyclicRevivalDBResponse,
    }

    async fn seed(pool: &PgPool, mail_credit: i32, sms_credit: i32) -> Seed {
        let owner = create_test_member(pool, "owner").await;
        let service = create_test_service(pool, owner.id, "Shop").await;
        let mut conn = pool.acquire().await.unwrap();
        let tag = ProfileTags::new(&mut conn)
            .create(&ProfileTagCreateDBRequest {
                service_id: service.id,
                name: "Regulars".to_string(),
                slug: "regulars".to_string(),
                is_reserved: false,
                is_auto: false,
            })
            .await
            .unwrap();
        for fan in ["ada@example.com", "bob@example.com"] {
            let member = create_test_member(pool, fan).await;
            ProfileTags::new(&mut conn).set_member_tags(service.id, member.id, &[tag.id]).await.unwrap();
        }
        MessagingBalances::new(&mut conn).credit(service.id, mail_credit, sms_credit).await.unwrap();
        let revival = CyclicRevivals::new(&mut conn)
            .create(&CyclicRevivalCreateDBRequest {
                service_id: service.id,
                profile_tag_id: tag.id,
                hour_of_sending: 9,
                days_cycle: None,
                day_of_week_list: vec![1, 4],
                day_of_month_list: vec![],
                mail_subject: "This week".to_string(),
                mail_content: "<p>Hello $client</p>".to_string(),
                sms_text: String::new(),
                next_run_on: now().date_naive(),
                end_on: None,
            })
            .await
            .unwrap();
        Seed {
            service_id: service.id,
            tag_id: tag.id,
            revival,
        }
    }

    fn jobs(pool: &PgPool) -> RevivalJobs {
        RevivalJobs::new(DbRouter::new(pool.clone()), create_test_notifier())
    }

    async fn reload(pool: &PgPool, seed: &Seed) -> Option<CyclicRevivalDBResponse> {
        let mut conn = pool.acquire().await.unwrap();
        CyclicRevivals::new(&mut conn).get_by_id(seed.revival.id).await.unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_due_revival_mails_tag_members_and_reschedules(pool: PgPool) {
        let seed = seed(&pool, 10, 0).await;
        let jobs = jobs(&pool);

        // Wrong hour
        assert_eq!(jobs.run_cyclic_revivals(now() + Duration::hours(1)).await.unwrap().revivals, 0);

        let report = jobs.run_cyclic_revivals(now()).await.unwrap();
        assert_eq!(report.revivals, 1);
        assert_eq!(report.mails, 2);

        let revival = reload(&pool, &seed).await.unwrap();
        // Monday to Thursday
        assert_eq!(revival.next_run_on, NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        assert!(!revival.is_running);

        let mut conn = pool.acquire().await.unwrap();
        let targets = CyclicRevivals::new(&mut conn).targets(seed.revival.id, 0, 10).await.unwrap();
        assert!(targets.iter().all(|t| t.revival_count == 1));
        assert_eq!(MessagingBalances::new(&mut conn).get(seed.service_id).await.unwrap().mail_count, 8);
        drop(conn);

        // Already moved to Thursday
        assert_eq!(jobs.run_cyclic_revivals(now()).await.unwrap().revivals, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_stops_when_credit_runs_out(pool: PgPool) {
        let seed = seed(&pool, 1, 0).await;
        let report = jobs(&pool).run_cyclic_revivals(now()).await.unwrap();
        assert_eq!(report.mails, 1);

        let mut conn = pool.acquire().await.unwrap();
        let events = Events::new(&mut conn)
            .list_for_service(seed.service_id, EventType::EmptyMessagingCredit)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_no_credit_records_event(pool: PgPool) {
        let seed = seed(&pool, 0, 0).await;
        let report = jobs(&pool).run_cyclic_revivals(now()).await.unwrap();
        assert_eq!(report.revivals, 0);
        // Not rescheduled, it runs again once credit is bought
        assert_eq!(reload(&pool, &seed).await.unwrap().next_run_on, now().date_naive());

        let mut conn = pool.acquire().await.unwrap();
        let events = Events::new(&mut conn)
            .list_for_service(seed.service_id, EventType::EmptyMessagingCredit)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_abandoned_run_is_taken_over(pool: PgPool) {
        let seed = seed(&pool, 10, 0).await;
        let crashed_at = now() - Duration::minutes(30);
        let mut conn = pool.acquire().await.unwrap();
        assert!(
            CyclicRevivals::new(&mut conn)
                .try_start_run(seed.revival.id, crashed_at, stale_before(crashed_at))
                .await
                .unwrap()
        );
        drop(conn);

        // A claim this fresh still holds
        let report = jobs(&pool).run_cyclic_revivals(now()).await.unwrap();
        assert_eq!(report.revivals, 0);

        let report = jobs(&pool).run_cyclic_revivals(now() + Duration::minutes(40)).await.unwrap();
        assert_eq!(report.revivals, 1);
        assert!(!reload(&pool, &seed).await.unwrap().is_running);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_revival_without_tag_is_deleted(pool: PgPool) {
        let seed = seed(&pool, 10, 0).await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(ProfileTags::new(&mut conn).delete(seed.tag_id).await.unwrap());
        drop(conn);

        let report = jobs(&pool).run_cyclic_revivals(now()).await.unwrap();
        assert_eq!(report.mails, 0);
        assert!(reload(&pool, &seed).await.is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_ended_revival_is_not_due(pool: PgPool) {
        let seed = seed(&pool, 10, 0).await;
        let mut conn = pool.acquire().await.unwrap();
        CyclicRevivals::new(&mut conn)
            .update(
                seed.revival.id,
                &CyclicRevivalUpdateDBRequest {
                    end_on: Some(now().date_naive()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        drop(conn);

        assert_eq!(jobs(&pool).run_cyclic_revivals(now()).await.unwrap().revivals, 0);
    }
}
