use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FleetError, Result};
use crate::fleet::bot::HealthStatus;
use crate::fleet::registry::BotRegistry;
use crate::scheduler::job::{Job, JobOutcome, ReleaseReason};
use crate::scheduler::store::{ClaimFilter, Completion, JobStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed { job: Job },
    /// The bot is at capacity and already holds `job`. Returned to a retried
    /// claim whose first response was lost; nothing changed on the job.
    Redelivered { job: Job },
    /// Nothing eligible right now; back off and retry.
    NoneAvailable,
    /// The bot already holds `max_concurrency` jobs and none of them can be
    /// handed back.
    AtCapacity,
}

impl ClaimOutcome {
    pub fn job(&self) -> Option<&Job> {
        match self {
            ClaimOutcome::Claimed { job } | ClaimOutcome::Redelivered { job } => Some(job),
            _ => None,
        }
    }

    pub fn into_job(self) -> Option<Job> {
        match self {
            ClaimOutcome::Claimed { job } | ClaimOutcome::Redelivered { job } => Some(job),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAck {
    pub ok: bool,
    /// True when this report repeated one already applied.
    pub replayed: bool,
}

/// Request-time claim logic: session and health gate, capacity reservation,
/// operation affinity and adoption, and result reporting.
#[derive(Debug)]
pub struct ClaimCoordinator {
    jobs: Arc<JobStore>,
    bots: Arc<BotRegistry>,
    lease: Duration,
    default_queue: Option<String>,
    clock: Arc<dyn Clock>,
}

impl ClaimCoordinator {
    pub fn new(
        jobs: Arc<JobStore>,
        bots: Arc<BotRegistry>,
        lease: Duration,
        default_queue: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            bots,
            lease,
            default_queue,
            clock,
        }
    }

    /// Atomically assign the next eligible job to `bot_id`.
    ///
    /// Capacity is reserved on the bot before touching the job table and
    /// handed back if nothing is claimed, so `active_claims` can never pass
    /// `max_concurrency` even under concurrent claims from the same bot.
    ///
    /// A bot at capacity gets back the job it claimed most recently, so
    /// repeating a claim whose response was lost takes nothing new.
    pub async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome> {
        let now = self.clock.now();
        let filter = self
            .bots
            .update(bot_id, |bot| {
                bot.check_live_session(session_id, now)?;
                if bot.health_status == HealthStatus::Unhealthy {
                    return Err(FleetError::BotUnhealthy(bot_id));
                }
                if !bot.reserve_claim() {
                    return Ok(None);
                }
                Ok(Some(ClaimFilter {
                    operation: bot.assigned_operation.clone(),
                    supported: bot.capabilities.operations.clone(),
                    queue: bot.queue.clone().or_else(|| self.default_queue.clone()),
                }))
            })
            .await?;

        let Some(filter) = filter else {
            return self.redeliver(bot_id).await;
        };

        let claimed = match self.jobs.claim_next(bot_id, &filter, self.lease).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.bots.release_claims(bot_id, 1).await?;
                return Err(e);
            }
        };

        let Some(claimed) = claimed else {
            self.bots.release_claims(bot_id, 1).await?;
            return Ok(ClaimOutcome::NoneAvailable);
        };

        if let Some(previous) = claimed.reclaimed_from {
            self.bots.release_claims(previous, 1).await?;
        }

        if filter.operation.is_none() {
            let operation = claimed.job.operation.clone();
            let adopted = self
                .bots
                .update(bot_id, |bot| {
                    // A re-registration in between starts a session that
                    // has not adopted anything.
                    if bot.assigned_operation.is_some() || bot.session_id != session_id {
                        return Ok(false);
                    }
                    bot.assigned_operation = Some(operation.clone());
                    bot.updated_at = now;
                    Ok(true)
                })
                .await?;
            if adopted {
                tracing::info!(bot_id = %bot_id, operation = %operation, "Bot adopted operation");
            }
        }

        Ok(ClaimOutcome::Claimed { job: claimed.job })
    }

    async fn redeliver(&self, bot_id: Uuid) -> Result<ClaimOutcome> {
        let now = self.clock.now();
        let held = self
            .jobs
            .jobs_for_bot(bot_id)
            .await?
            .into_iter()
            .filter(|job| !job.lease_expired(now))
            .max_by_key(|job| job.claim_expires_at);

        match held {
            Some(job) => {
                tracing::debug!(bot_id = %bot_id, job_id = %job.id, "Bot at capacity, redelivering held job");
                Ok(ClaimOutcome::Redelivered { job })
            }
            None => {
                tracing::debug!(bot_id = %bot_id, "Claim refused, bot at capacity");
                Ok(ClaimOutcome::AtCapacity)
            }
        }
    }

    /// Record the result of a claimed job and free the bot's capacity.
    ///
    /// Only the session check is required of the bot; the lease may have
    /// run out as long as nobody else has taken the job. A bot that lost the
    /// job gets `ClaimConflict`.
    pub async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<ReportAck> {
        self.bots
            .update(bot_id, |bot| bot.check_session(session_id))
            .await?;

        match self.jobs.finish(job_id, bot_id, outcome).await? {
            Completion::Applied => {
                self.bots.release_claims(bot_id, 1).await?;
                Ok(ReportAck {
                    ok: true,
                    replayed: false,
                })
            }
            Completion::Replayed => Ok(ReportAck {
                ok: true,
                replayed: true,
            }),
        }
    }

    /// Operator release: put a claimed job back to pending and free its
    /// holder's capacity.
    pub async fn release(&self, job_id: Uuid, reason: ReleaseReason) -> Result<Option<Uuid>> {
        let holder = self.jobs.release(job_id, reason).await?;
        if let Some(bot_id) = holder {
            self.bots.release_claims(bot_id, 1).await?;
        }
        Ok(holder)
    }
}
