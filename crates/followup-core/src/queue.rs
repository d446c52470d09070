//! Durable job queue on redb.
//!
//! # Table design
//!
//! ```text
//! jobs     uuid string                                    -> Job (JSON)
//! waiting  [ run_at_ms: u64 BE (8 bytes) | uuid (16) ]    -> empty
//! ```
//!
//! `jobs` is the source of truth. `waiting` indexes jobs in the `Waiting`
//! state by due time: the timestamp occupies the high bytes in big-endian
//! order, so a range scan `..=due_upper_bound(now)` yields due jobs
//! earliest first. Claiming a job removes its index entry and flips it to
//! `Active` inside the same write transaction, so two workers can never
//! claim the same job.
//!
//! Delivery is at-least-once: a job whose worker died stays `Active` until
//! its lock expires, then [`JobQueue::recover_stalled`] puts it back.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FollowupError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const WAITING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("waiting");

/// Index entries carry no value.
const EMPTY: &[u8] = &[];

/// A job requeued by stall detection more often than this is failed.
pub const MAX_STALLED_COUNT: u32 = 1;

fn queue_err(e: impl std::fmt::Display) -> FollowupError {
    FollowupError::Queue(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn waiting_key(run_at: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = run_at.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound covering every job due by `now`: the UUID suffix is all
/// `0xff`, greater than any real id.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    /// Wait before the retry that follows failure number `attempts_made`
    /// (1-based). Exponential backoff doubles per failure.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let shift = attempts_made.saturating_sub(1).min(32);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total tries including the first.
    pub attempts: u32,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    /// Failed tries so far.
    pub attempts_made: u32,
    #[serde(default)]
    pub stalled_count: u32,
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What [`JobQueue::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: DateTime<Utc> },
    Failed,
    /// Exhausted and dropped (`remove_on_fail`).
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

pub struct JobQueue {
    name: String,
    db: Database,
    closed: AtomicBool,
}

impl JobQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(queue_err)?;
        let wt = db.begin_write().map_err(queue_err)?;
        wt.open_table(JOBS).map_err(queue_err)?;
        wt.open_table(WAITING).map_err(queue_err)?;
        wt.commit().map_err(queue_err)?;
        let name = name.into();
        tracing::debug!(queue = %name, path = %path.display(), "job queue opened");
        Ok(Self {
            name,
            db,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting operations. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(queue = %self.name, "job queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FollowupError::Queue(format!("queue '{}' is closed", self.name)));
        }
        Ok(())
    }

    /// Add a job that is due immediately.
    pub fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.ensure_open()?;
        let job = Job {
            id: Uuid::new_v4(),
            name: name.to_string(),
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            stalled_count: 0,
            run_at: now,
            lock_expires_at: None,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        let wt = self.db.begin_write().map_err(queue_err)?;
        {
            let mut jobs = wt.open_table(JOBS).map_err(queue_err)?;
            let mut waiting = wt.open_table(WAITING).map_err(queue_err)?;
            put_job(&mut jobs, &job)?;
            waiting
                .insert(waiting_key(job.run_at, job.id).as_slice(), EMPTY)
                .map_err(queue_err)?;
        }
        wt.commit().map_err(queue_err)?;
        tracing::info!(queue = %self.name, job_id = %job.id, name, "job enqueued");
        Ok(job)
    }

    /// Move the earliest job due by `now` to `Active`, locked until
    /// `now + lock_duration`.
    pub fn claim_next(&self, now: DateTime<Utc>, lock_duration: Duration) -> Result<Option<Job>> {
        self.ensure_open()?;
        let upper = due_upper_bound(now);
        let wt = self.db.begin_write().map_err(queue_err)?;
        let claimed = {
            let mut waiting = wt.open_table(WAITING).map_err(queue_err)?;
            let mut jobs = wt.open_table(JOBS).map_err(queue_err)?;
            let mut claimed = None;
            loop {
                let next_key = {
                    let mut range = waiting.range(..=upper.as_slice()).map_err(queue_err)?;
                    match range.next() {
                        Some(entry) => {
                            let (k, _) = entry.map_err(queue_err)?;
                            Some(k.value().to_vec())
                        }
                        None => None,
                    }
                };
                let Some(key) = next_key else { break };
                waiting.remove(key.as_slice()).map_err(queue_err)?;

                let id = Uuid::from_slice(&key[8..]).map_err(queue_err)?;
                let Some(mut job) = get_job(&jobs, id)? else {
                    // Index entry outlived its job.
                    continue;
                };
                if job.state != JobState::Waiting {
                    continue;
                }
                job.state = JobState::Active;
                job.started_at = Some(now);
                job.lock_expires_at = Some(now + lock_duration);
                put_job(&mut jobs, &job)?;
                claimed = Some(job);
                break;
            }
            claimed
        };
        wt.commit().map_err(queue_err)?;
        if let Some(job) = &claimed {
            tracing::debug!(queue = %self.name, job_id = %job.id, name = %job.name, "job claimed");
        }
        Ok(claimed)
    }

    /// Mark an active job completed, or drop it if `remove_on_complete`.
    pub fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        let wt = self.db.begin_write().map_err(queue_err)?;
        {
            let mut jobs = wt.open_table(JOBS).map_err(queue_err)?;
            let mut job = get_job(&jobs, id)?.ok_or_else(|| FollowupError::JobNotFound(id.to_string()))?;
            if job.options.remove_on_complete {
                jobs.remove(id.to_string().as_str()).map_err(queue_err)?;
            } else {
                job.state = JobState::Completed;
                job.lock_expires_at = None;
                job.finished_at = Some(now);
                put_job(&mut jobs, &job)?;
            }
        }
        wt.commit().map_err(queue_err)?;
        tracing::info!(queue = %self.name, job_id = %id, "job completed");
        Ok(())
    }

    /// Record a failed try. Retries with backoff until `attempts` is used
    /// up, then fails (or drops) the job.
    pub fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<FailOutcome> {
        self.ensure_open()?;
        let wt = self.db.begin_write().map_err(queue_err)?;
        let outcome = {
            let mut jobs = wt.open_table(JOBS).map_err(queue_err)?;
            let mut waiting = wt.open_table(WAITING).map_err(queue_err)?;
            let mut job = get_job(&jobs, id)?.ok_or_else(|| FollowupError::JobNotFound(id.to_string()))?;
            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            job.lock_expires_at = None;
            retry_or_fail(&mut jobs, &mut waiting, &mut job, now)?
        };
        wt.commit().map_err(queue_err)?;
        match outcome {
            FailOutcome::Retrying { run_at } => {
                tracing::warn!(queue = %self.name, job_id = %id, error, retry_at = %run_at, "job failed; will retry")
            }
            FailOutcome::Failed | FailOutcome::Removed => {
                tracing::error!(queue = %self.name, job_id = %id, error, "job failed; attempts exhausted")
            }
        }
        Ok(outcome)
    }

    /// Requeue active jobs whose lock expired before `now`. A job that has
    /// already stalled [`MAX_STALLED_COUNT`] times is failed instead.
    /// Returns the ids of the jobs that were touched.
    pub fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.ensure_open()?;
        let wt = self.db.begin_write().map_err(queue_err)?;
        let recovered = {
            let mut jobs = wt.open_table(JOBS).map_err(queue_err)?;
            let mut waiting = wt.open_table(WAITING).map_err(queue_err)?;
            let stalled: Vec<Job> = scan_jobs(&jobs)?
                .into_iter()
                .filter(|j| {
                    j.state == JobState::Active && j.lock_expires_at.is_some_and(|t| t < now)
                })
                .collect();
            let mut ids = Vec::with_capacity(stalled.len());
            for mut job in stalled {
                job.stalled_count += 1;
                job.lock_expires_at = None;
                if job.stalled_count > MAX_STALLED_COUNT {
                    job.attempts_made = job.options.attempts.max(job.attempts_made);
                    job.last_error = Some("job stalled more than allowable limit".to_string());
                    retry_or_fail(&mut jobs, &mut waiting, &mut job, now)?;
                } else {
                    job.state = JobState::Waiting;
                    job.run_at = now;
                    put_job(&mut jobs, &job)?;
                    waiting
                        .insert(waiting_key(job.run_at, job.id).as_slice(), EMPTY)
                        .map_err(queue_err)?;
                }
                tracing::warn!(queue = %self.name, job_id = %job.id, stalled_count = job.stalled_count, "stalled job recovered");
                ids.push(job.id);
            }
            ids
        };
        wt.commit().map_err(queue_err)?;
        Ok(recovered)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let rt = self.db.begin_read().map_err(queue_err)?;
        let jobs = rt.open_table(JOBS).map_err(queue_err)?;
        get_job(&jobs, id)
    }

    /// Every stored job, newest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let rt = self.db.begin_read().map_err(queue_err)?;
        let jobs = rt.open_table(JOBS).map_err(queue_err)?;
        let mut all = scan_jobs(&jobs)?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    pub fn counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.list()? {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Table helpers
// ---------------------------------------------------------------------------

fn get_job(jobs: &impl ReadableTable<&'static str, &'static [u8]>, id: Uuid) -> Result<Option<Job>> {
    match jobs.get(id.to_string().as_str()).map_err(queue_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn put_job(jobs: &mut redb::Table<&'static str, &'static [u8]>, job: &Job) -> Result<()> {
    let bytes = serde_json::to_vec(job)?;
    jobs.insert(job.id.to_string().as_str(), bytes.as_slice())
        .map_err(queue_err)?;
    Ok(())
}

fn scan_jobs(jobs: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<Job>> {
    let mut out = Vec::new();
    for entry in jobs.iter().map_err(queue_err)? {
        let (_, v) = entry.map_err(queue_err)?;
        out.push(serde_json::from_slice(v.value())?);
    }
    Ok(out)
}

/// Shared tail of `fail` and stall handling: `job.attempts_made` already
/// counts the latest failure.
fn retry_or_fail(
    jobs: &mut redb::Table<&'static str, &'static [u8]>,
    waiting: &mut redb::Table<&'static [u8], &'static [u8]>,
    job: &mut Job,
    now: DateTime<Utc>,
) -> Result<FailOutcome> {
    if job.attempts_made < job.options.attempts {
        let delay = job
            .options
            .backoff
            .map(|b| b.delay_for(job.attempts_made))
            .unwrap_or_else(Duration::zero);
        job.state = JobState::Waiting;
        job.run_at = now + delay;
        put_job(jobs, job)?;
        waiting
            .insert(waiting_key(job.run_at, job.id).as_slice(), EMPTY)
            .map_err(queue_err)?;
        return Ok(FailOutcome::Retrying { run_at: job.run_at });
    }
    if job.options.remove_on_fail {
        jobs.remove(job.id.to_string().as_str()).map_err(queue_err)?;
        return Ok(FailOutcome::Removed);
    }
    job.state = JobState::Failed;
    job.finished_at = Some(now);
    put_job(jobs, job)?;
    Ok(FailOutcome::Failed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
