//! Daily trigger: enqueues one `process-follow-ups` job per day at a fixed
//! local wall-clock time. The trigger only enqueues; retries and restart
//! survival come from the durable queue.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::error::{FollowupError, Result};
use crate::orchestrator::PROCESS_FOLLOW_UPS;
use crate::queue::{Job, JobOptions, JobQueue};

pub struct DailyTrigger {
    queue: Arc<JobQueue>,
    at: NaiveTime,
    options: JobOptions,
}

impl DailyTrigger {
    pub fn new(queue: Arc<JobQueue>, hour: u32, minute: u32, options: JobOptions) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            FollowupError::Configuration(format!("invalid schedule time {hour:02}:{minute:02}"))
        })?;
        Ok(Self { queue, at, options })
    }

    /// First fire time strictly after `after`, in `after`'s time zone.
    ///
    /// A fire time that falls in a DST gap moves to the next day that has
    /// it; an ambiguous one resolves to the earlier instant.
    pub fn next_fire_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = after.timezone();
        let mut day = after.date_naive();
        for _ in 0..4 {
            if let Some(candidate) = tz.from_local_datetime(&day.and_time(self.at)).earliest() {
                if candidate > *after {
                    return candidate;
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        after.clone() + Duration::days(1)
    }

    /// Enqueue the daily job now.
    pub fn fire(&self, now: DateTime<Utc>) -> Result<Job> {
        let payload = serde_json::json!({ "triggered_at": now });
        self.queue
            .enqueue(PROCESS_FOLLOW_UPS, payload, self.options, now)
    }

    /// Sleep until each local fire time and enqueue, until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(at = %self.at, "daily trigger started");
        loop {
            let now = Local::now();
            let next = self.next_fire_after(&now);
            let wait = (next.clone() - now).to_std().unwrap_or_default();
            tracing::debug!(next = %next, "next follow-up run scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.fire(Utc::now()) {
                Ok(job) => tracing::info!(job_id = %job.id, "daily follow-up job enqueued"),
                Err(e) => tracing::error!(error = %e, "failed to enqueue daily follow-up job"),
            }
        }
        tracing::info!("daily trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use chrono::{FixedOffset, NaiveDate};
    use tempfile::TempDir;

    fn trigger(hour: u32, minute: u32) -> (TempDir, Arc<JobQueue>, DailyTrigger) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(&dir.path().join("queue.redb"), "follow-ups").unwrap());
        let options = JobOptions {
            attempts: 3,
            backoff: Some(Backoff::exponential(5000)),
            remove_on_complete: true,
            remove_on_fail: false,
        };
        let t = DailyTrigger::new(queue.clone(), hour, minute, options).unwrap();
        (dir, queue, t)
    }

    fn at(tz: &FixedOffset, h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        let naive = NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap();
        tz.from_local_datetime(&naive).unwrap()
    }

    #[test]
    fn next_fire_is_today_before_noon_and_tomorrow_after() {
        let (_dir, _queue, t) = trigger(12, 0);
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();

        let morning = at(&tz, 9, 30, 0);
        assert_eq!(t.next_fire_after(&morning), at(&tz, 12, 0, 0));

        let exactly = at(&tz, 12, 0, 0);
        let next = t.next_fire_after(&exactly);
        assert_eq!(next, at(&tz, 12, 0, 0) + Duration::days(1));

        let evening = at(&tz, 18, 0, 0);
        assert_eq!(t.next_fire_after(&evening), at(&tz, 12, 0, 0) + Duration::days(1));
    }

    #[test]
    fn next_fire_respects_offset() {
        let (_dir, _queue, t) = trigger(12, 0);
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let next = t.next_fire_after(&at(&tz, 11, 59, 59));
        assert_eq!(next.with_timezone(&Utc).to_rfc3339(), "2024-03-14T03:00:00+00:00");
    }

    #[test]
    fn fire_enqueues_follow_up_job_with_retry_options() {
        let (_dir, queue, t) = trigger(12, 0);
        let job = t.fire(Utc::now()).unwrap();
        assert_eq!(job.name, PROCESS_FOLLOW_UPS);
        assert_eq!(job.options.attempts, 3);
        assert!(job.options.remove_on_complete);
        assert!(!job.options.remove_on_fail);
        assert_eq!(queue.counts().unwrap().waiting, 1);
    }

    #[test]
    fn invalid_time_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(&dir.path().join("q.redb"), "q").unwrap());
        let err = DailyTrigger::new(queue, 25, 0, JobOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, FollowupError::Configuration(_)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_dir, _queue, t) = trigger(12, 0);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(t.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("trigger did not stop")
            .unwrap();
    }
}
