use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Succeeded,
    Failed,
    /// Transient: a released job re-enters `Pending` in the same transition.
    Released,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Released => write!(f, "released"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "released" => Ok(JobStatus::Released),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The claim lease passed without a report.
    LeaseExpired,
    /// The holder missed heartbeats past the unhealthy threshold.
    BotUnhealthy,
    /// An operator released the job.
    Requested,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseReason::LeaseExpired => write!(f, "lease_expired"),
            ReleaseReason::BotUnhealthy => write!(f, "bot_unhealthy"),
            ReleaseReason::Requested => write!(f, "requested"),
        }
    }
}

/// What a bot reports after executing a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { result: i64 },
    Failure { error: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } => JobStatus::Succeeded,
            JobOutcome::Failure { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub operation: String,
    pub args: Vec<i64>,
    pub queue: Option<String>,
    pub status: JobStatus,
    pub claimed_by: Option<Uuid>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub result: Option<i64>,
    pub error: Option<String>,
    /// Bot whose report moved the job to a terminal state.
    pub completed_by: Option<Uuid>,
    pub last_release: Option<ReleaseReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        operation: String,
        args: Vec<i64>,
        queue: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            args,
            queue,
            status: JobStatus::Pending,
            claimed_by: None,
            claim_expires_at: None,
            attempts: 0,
            result: None,
            error: None,
            completed_by: None,
            last_release: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    pub fn is_held_by(&self, bot_id: Uuid) -> bool {
        self.status == JobStatus::Claimed && self.claimed_by == Some(bot_id)
    }

    /// Pending, or claimed with a lease that has already run out.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Claimed => self.lease_expired(now),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Claimed && self.claim_expires_at.is_some_and(|t| t <= now)
    }

    pub(crate) fn claim(&mut self, bot_id: Uuid, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(bot_id);
        self.claim_expires_at = Some(lease_until);
        self.attempts += 1;
        self.updated_at = now;
    }

    /// `claimed -> released -> pending`, clearing the claim. `Released` is
    /// never observable outside this call; `last_release` records it.
    pub(crate) fn release(&mut self, reason: ReleaseReason, now: DateTime<Utc>) {
        self.claimed_by = None;
        self.claim_expires_at = None;
        self.last_release = Some(reason);
        self.status = JobStatus::Pending;
        self.updated_at = now;
    }

    pub(crate) fn finish(&mut self, bot_id: Uuid, outcome: &JobOutcome, now: DateTime<Utc>) {
        self.status = outcome.status();
        match outcome {
            JobOutcome::Success { result } => {
                self.result = Some(*result);
                self.error = None;
            }
            JobOutcome::Failure { error } => {
                self.result = None;
                self.error = Some(error.clone());
            }
        }
        self.claimed_by = None;
        self.claim_expires_at = None;
        self.completed_by = Some(bot_id);
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}
