use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FleetError, Result};
use crate::record::Record;
use crate::scheduler::job::{Job, JobOutcome, JobStatus, ReleaseReason};

const DEFAULT_MAX_JOBS: usize = 100_000;

/// Which jobs a claim may take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Pinned or adopted operation. When set, nothing else is eligible.
    pub operation: Option<String>,
    /// Advertised capabilities, consulted only when `operation` is unset.
    /// Empty means any operation.
    pub supported: Vec<String>,
    /// Queue partition. `None` claims from every queue.
    pub queue: Option<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn pinned(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn in_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        let operation_ok = match &self.operation {
            Some(op) => job.operation == *op,
            None => self.supported.is_empty() || self.supported.contains(&job.operation),
        };
        let queue_ok = match &self.queue {
            Some(q) => job.queue.as_deref() == Some(q.as_str()),
            None => true,
        };
        operation_ok && queue_ok
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    /// Holder whose expired lease was taken over, if any.
    pub reclaimed_from: Option<Uuid>,
}

/// Result of a terminal report against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The job moved to its terminal state now.
    Applied,
    /// Same bot, same outcome, already recorded. No side effects.
    Replayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedClaim {
    pub job_id: Uuid,
    pub bot_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.succeeded + self.failed
    }
}

#[derive(Debug, Default)]
struct Tables {
    /// Enqueue order. Sequence numbers are handed out monotonically, so this
    /// is also `created_at` order with ties broken by arrival.
    ordered: BTreeMap<u64, Arc<Record<Job>>>,
    /// The subset of `ordered` not yet succeeded or failed. Claim and
    /// release scans only walk this.
    open: BTreeMap<u64, Arc<Record<Job>>>,
    by_id: HashMap<Uuid, (u64, Arc<Record<Job>>)>,
}

impl Tables {
    fn insert(&mut self, seq: u64, job: Job) {
        let id = job.id;
        let record = Arc::new(Record::new(job));
        self.ordered.insert(seq, record.clone());
        self.open.insert(seq, record.clone());
        self.by_id.insert(id, (seq, record));
    }
}

/// In-memory job table with per-record conditional transitions.
///
/// The table lock only guards membership (insert, finish, purge). Every state change
/// locks the single job record, checks the expected prior state and applies
/// the transition before releasing it, so two racing claimers can never both
/// win the same job and a release never clobbers a newer claim.
#[derive(Debug)]
pub struct JobStore {
    tables: RwLock<Tables>,
    next_seq: AtomicU64,
    max_jobs: usize,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS, clock)
    }

    pub fn with_capacity(max_jobs: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_seq: AtomicU64::new(0),
            max_jobs,
            clock,
        }
    }

    pub async fn enqueue(
        &self,
        operation: impl Into<String>,
        args: Vec<i64>,
        queue: Option<String>,
    ) -> Result<Job> {
        let job = Job::new(operation.into(), args, queue, self.clock.now());
        let mut tables = self.tables.write().await;
        if tables.by_id.len() >= self.max_jobs {
            return Err(FleetError::QueueFull(self.max_jobs));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tables.insert(seq, job.clone());
        tracing::debug!(job_id = %job.id, operation = %job.operation, "Job enqueued");
        Ok(job)
    }

    /// Enqueue one job per argument list. Fails with `QueueFull`, adding
    /// nothing, unless the whole batch fits.
    pub async fn enqueue_many(
        &self,
        operation: &str,
        batch: Vec<Vec<i64>>,
        queue: Option<String>,
    ) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        if tables.by_id.len().saturating_add(batch.len()) > self.max_jobs {
            return Err(FleetError::QueueFull(self.max_jobs));
        }
        let mut jobs = Vec::with_capacity(batch.len());
        for args in batch {
            let job = Job::new(operation.to_string(), args, queue.clone(), now);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            tables.insert(seq, job.clone());
            jobs.push(job);
        }
        Ok(jobs)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        let record = self.record(job_id).await?;
        record.snapshot()
    }

    /// Claim the oldest eligible job for `bot_id`.
    ///
    /// Candidates are visited in FIFO order; each one is locked and
    /// re-checked before it is taken, so a bot that loses a race on one job
    /// simply moves on to the next. Returns `None` when nothing matches.
    pub async fn claim_next(
        &self,
        bot_id: Uuid,
        filter: &ClaimFilter,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        for record in tables.open.values() {
            let mut job = record.lock()?;
            if !job.is_claimable(now) || !filter.matches(&job) {
                continue;
            }
            let reclaimed_from = job.claimed_by.filter(|_| job.status == JobStatus::Claimed);
            job.claim(bot_id, now + lease, now);
            tracing::info!(
                job_id = %job.id,
                bot_id = %bot_id,
                operation = %job.operation,
                attempts = job.attempts,
                reclaimed_from = ?reclaimed_from,
                "Job claimed"
            );
            return Ok(Some(ClaimedJob {
                job: job.clone(),
                reclaimed_from,
            }));
        }
        Ok(None)
    }

    /// Release a claimed job whoever holds it. Returns the previous holder;
    /// releasing a job that is not claimed is a no-op.
    pub async fn release(&self, job_id: Uuid, reason: ReleaseReason) -> Result<Option<Uuid>> {
        let record = self.record(job_id).await?;
        let mut job = record.lock()?;
        if job.status != JobStatus::Claimed {
            return Ok(None);
        }
        let holder = job.claimed_by;
        job.release(reason, self.clock.now());
        tracing::info!(job_id = %job_id, holder = ?holder, reason = %reason, "Job released");
        Ok(holder)
    }

    /// Release `job_id` only if `bot_id` still holds it.
    pub async fn release_if_held(
        &self,
        job_id: Uuid,
        bot_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<bool> {
        let record = self.record(job_id).await?;
        let mut job = record.lock()?;
        if !job.is_held_by(bot_id) {
            return Ok(false);
        }
        job.release(reason, self.clock.now());
        tracing::info!(job_id = %job_id, bot_id = %bot_id, reason = %reason, "Job released");
        Ok(true)
    }

    /// Release every job currently held by `bot_id`.
    ///
    /// Each job is released under its own record lock with the
    /// `claimed_by = bot_id` predicate, so re-running after an interruption
    /// only touches what is still held and never a job another bot has since
    /// claimed.
    pub async fn release_claims_of(&self, bot_id: Uuid, reason: ReleaseReason) -> Result<Vec<Uuid>> {
        let now = self.clock.now();
        let records = self.open_records().await;

        let mut released = Vec::new();
        for record in records {
            let mut job = record.lock()?;
            if job.is_held_by(bot_id) {
                job.release(reason, now);
                released.push(job.id);
            }
        }
        if !released.is_empty() {
            tracing::warn!(bot_id = %bot_id, count = released.len(), reason = %reason, "Released bot claims");
        }
        Ok(released)
    }

    /// Release every claim whose lease has passed.
    pub async fn release_expired(&self) -> Result<Vec<ReleasedClaim>> {
        let now = self.clock.now();
        let records = self.open_records().await;

        let mut released = Vec::new();
        for record in records {
            let mut job = record.lock()?;
            if !job.lease_expired(now) {
                continue;
            }
            if let Some(bot_id) = job.claimed_by {
                job.release(ReleaseReason::LeaseExpired, now);
                tracing::info!(job_id = %job.id, bot_id = %bot_id, "Claim lease expired, job released");
                released.push(ReleasedClaim {
                    job_id: job.id,
                    bot_id,
                });
            }
        }
        Ok(released)
    }

    pub async fn complete(&self, job_id: Uuid, bot_id: Uuid, result: i64) -> Result<Completion> {
        self.finish(job_id, bot_id, JobOutcome::Success { result })
            .await
    }

    pub async fn fail(&self, job_id: Uuid, bot_id: Uuid, error: String) -> Result<Completion> {
        self.finish(job_id, bot_id, JobOutcome::Failure { error })
            .await
    }

    /// Move a held job to its terminal state.
    ///
    /// A caller that no longer holds the job gets `ClaimConflict`: it lost
    /// the lease and must not retry against this job.
    pub async fn finish(
        &self,
        job_id: Uuid,
        bot_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<Completion> {
        let (seq, record) = self.entry(job_id).await?;
        let completion = Self::finish_record(&record, job_id, bot_id, &outcome, self.clock.now())?;
        if completion == Completion::Applied {
            self.tables.write().await.open.remove(&seq);
        }
        Ok(completion)
    }

    fn finish_record(
        record: &Record<Job>,
        job_id: Uuid,
        bot_id: Uuid,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion> {
        let mut job = record.lock()?;

        if job.is_held_by(bot_id) {
            job.finish(bot_id, outcome, now);
            tracing::info!(
                job_id = %job_id,
                bot_id = %bot_id,
                status = %job.status,
                attempts = job.attempts,
                "Job finished"
            );
            return Ok(Completion::Applied);
        }

        if job.status.is_terminal() && job.completed_by == Some(bot_id) {
            let same = match outcome {
                JobOutcome::Success { result } => {
                    job.status == JobStatus::Succeeded && job.result == Some(*result)
                }
                JobOutcome::Failure { error } => {
                    job.status == JobStatus::Failed && job.error.as_deref() == Some(error.as_str())
                }
            };
            if same {
                return Ok(Completion::Replayed);
            }
        }

        let reason = match job.status {
            JobStatus::Claimed => "job is claimed by another bot",
            JobStatus::Pending | JobStatus::Released => "claim was released",
            JobStatus::Succeeded | JobStatus::Failed => "job already finished",
        };
        tracing::warn!(job_id = %job_id, bot_id = %bot_id, status = %job.status, reason, "Report rejected");
        Err(FleetError::conflict(job_id, reason))
    }

    /// Jobs in enqueue order, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs = Vec::new();
        for record in tables.ordered.values() {
            let job = record.lock()?;
            if status.map_or(true, |s| job.status == s) {
                jobs.push(job.clone());
            }
        }
        Ok(jobs)
    }

    pub async fn jobs_for_bot(&self, bot_id: Uuid) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs = Vec::new();
        for record in tables.open.values() {
            let job = record.lock()?;
            if job.is_held_by(bot_id) {
                jobs.push(job.clone());
            }
        }
        Ok(jobs)
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        let tables = self.tables.read().await;
        let mut counts = JobCounts::default();
        for record in tables.ordered.values() {
            match record.lock()?.status {
                JobStatus::Pending | JobStatus::Released => counts.pending += 1,
                JobStatus::Claimed => counts.claimed += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Drop succeeded and failed jobs finished before `cutoff`. Returns the
    /// number of jobs removed.
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let mut doomed = Vec::new();
        for (seq, record) in &tables.ordered {
            let job = record.lock()?;
            if job.status.is_terminal() && job.completed_at.is_some_and(|t| t < cutoff) {
                doomed.push((*seq, job.id));
            }
        }
        for (seq, id) in &doomed {
            tables.ordered.remove(seq);
            tables.open.remove(seq);
            tables.by_id.remove(id);
        }
        Ok(doomed.len())
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.by_id.is_empty()
    }

    /// Jobs still pending or claimed.
    pub async fn open_len(&self) -> usize {
        self.tables.read().await.open.len()
    }

    async fn open_records(&self) -> Vec<Arc<Record<Job>>> {
        self.tables.read().await.open.values().cloned().collect()
    }

    async fn entry(&self, job_id: Uuid) -> Result<(u64, Arc<Record<Job>>)> {
        self.tables
            .read()
            .await
            .by_id
            .get(&job_id)
            .cloned()
            .ok_or(FleetError::JobNotFound(job_id))
    }

    async fn record(&self, job_id: Uuid) -> Result<Arc<Record<Job>>> {
        Ok(self.entry(job_id).await?.1)
    }
}
