//! Bot-side runtime: the loop a bot runs against the orchestrator.
//!
//! - [`resilience`]: the [`BotTransport`] contract plus retry and circuit breaking
//! - [`heartbeat`]: keeps the session alive in the background
//! - [`executor`]: runs claimed jobs against the local operation registry
//! - [`local`]: in-process transport for embedded bots
//!
//! # Worker loop
//!
//! 1. Register with a fresh idempotency key and adopt the returned backoff
//! 2. Spawn the heartbeat loop for the new session
//! 3. Claim, execute, report; back off while nothing is available
//! 4. On `SessionExpired` (from any call) stop heartbeating and go back to 1
//!
//! A `ClaimConflict` on report means another bot owns the job now. The
//! result is dropped and the loop carries on.

pub mod executor;
pub mod heartbeat;
pub mod local;
pub mod resilience;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::fleet::{RegistrationRequest, RegistrationResponse};
use crate::operations::OperationRegistry;
use crate::scheduler::{ClaimOutcome, Job, JobOutcome};

pub use executor::{ExecutionResult, JobExecutor};
pub use heartbeat::{HeartbeatEvent, HeartbeatLoop};
pub use local::LocalTransport;
pub use resilience::{BotTransport, CircuitBreaker, ResilientClient, RetryPolicy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub registrations: u32,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub conflicts: u64,
}

impl WorkerStats {
    /// Jobs this worker finished with, whether or not its report was accepted.
    pub fn handled(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.conflicts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    LimitReached,
    Expired,
}

pub struct BotWorker<T> {
    client: Arc<ResilientClient<T>>,
    executor: JobExecutor,
    request: RegistrationRequest,
    heartbeat_interval: Option<Duration>,
    job_limit: Option<u64>,
}

impl<T: BotTransport + 'static> BotWorker<T> {
    pub fn new(
        transport: T,
        request: RegistrationRequest,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        Self::with_client(Arc::new(ResilientClient::new(transport)), request, operations)
    }

    pub fn with_client(
        client: Arc<ResilientClient<T>>,
        request: RegistrationRequest,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            client,
            executor: JobExecutor::new(operations),
            request,
            heartbeat_interval: None,
            job_limit: None,
        }
    }

    /// Override the heartbeat interval the server hands out.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Stop after handling `limit` jobs.
    pub fn with_job_limit(mut self, limit: u64) -> Self {
        self.job_limit = Some(limit);
        self
    }

    pub fn client(&self) -> &Arc<ResilientClient<T>> {
        &self.client
    }

    /// Run until `shutdown` fires or the job limit is reached.
    ///
    /// Transient failures are retried indefinitely with backoff. Only a
    /// registration the orchestrator rejects outright (bad identity,
    /// unknown capability) ends the loop with an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let span = tracing::info_span!(
            "bot",
            bot_key = %self.request.bot_key,
            instance_id = %self.request.instance_id
        );
        self.run_sessions(shutdown).instrument(span).await
    }

    async fn run_sessions(self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let mut failures = 0u32;

        while !shutdown.is_cancelled() {
            let mut request = self.request.clone();
            request.idempotency_key = Some(Uuid::new_v4().to_string());

            let registration = match self.client.register(&request).await {
                Ok(registration) => registration,
                Err(e) if e.is_retryable() || matches!(e, FleetError::CircuitOpen(_)) => {
                    tracing::warn!(error = %e, "Registration failed, backing off");
                    if self.idle(&shutdown, failures).await {
                        break;
                    }
                    failures = failures.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(e),
            };
            failures = 0;
            stats.registrations += 1;
            self.client.set_backoff(registration.policy.backoff);

            match self.serve(&registration, &shutdown, &mut stats).await {
                SessionEnd::Shutdown | SessionEnd::LimitReached => break,
                SessionEnd::Expired => {
                    tracing::info!(bot_id = %registration.bot_id, "Session lost, re-registering");
                }
            }
        }

        tracing::info!(?stats, "Bot worker stopped");
        Ok(stats)
    }

    async fn serve(
        &self,
        registration: &RegistrationResponse,
        shutdown: &CancellationToken,
        stats: &mut WorkerStats,
    ) -> SessionEnd {
        let bot_id = registration.bot_id;
        let session_id = registration.session.session_id;

        let heartbeat = self
            .heartbeat_interval
            .map(HeartbeatLoop::new)
            .unwrap_or_else(|| HeartbeatLoop::from_secs(registration.session.heartbeat_interval_sec));
        let beats = shutdown.child_token();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(heartbeat.run(
            self.client.clone(),
            bot_id,
            session_id,
            tx,
            beats.clone(),
        ));

        tracing::info!(bot_id = %bot_id, session_id = %session_id, "Session started");

        let mut idle_streak = 0u32;
        let end = loop {
            if shutdown.is_cancelled() {
                break SessionEnd::Shutdown;
            }
            if self.job_limit.is_some_and(|limit| stats.handled() >= limit) {
                break SessionEnd::LimitReached;
            }
            match rx.try_recv() {
                Ok(HeartbeatEvent::SessionExpired) => break SessionEnd::Expired,
                Ok(HeartbeatEvent::Failed(e)) => {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
                Err(_) => {}
            }

            match self.client.claim(bot_id, session_id).await {
                // Jobs run one at a time, so a redelivered job is one whose
                // claim response never arrived.
                Ok(ClaimOutcome::Claimed { job } | ClaimOutcome::Redelivered { job }) => {
                    idle_streak = 0;
                    if let Some(end) = self.handle_job(job, bot_id, session_id, stats).await {
                        break end;
                    }
                }
                Ok(ClaimOutcome::NoneAvailable) | Ok(ClaimOutcome::AtCapacity) => {
                    if self.idle(shutdown, idle_streak).await {
                        break SessionEnd::Shutdown;
                    }
                    idle_streak = idle_streak.saturating_add(1);
                }
                Err(
                    FleetError::SessionExpired(_)
                    | FleetError::BotNotFound(_)
                    | FleetError::BotUnhealthy(_),
                ) => break SessionEnd::Expired,
                Err(e) => {
                    tracing::warn!(error = %e, "Claim failed");
                    if self.idle(shutdown, idle_streak).await {
                        break SessionEnd::Shutdown;
                    }
                    idle_streak = idle_streak.saturating_add(1);
                }
            }
        };

        beats.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Heartbeat task panicked");
        }
        end
    }

    async fn handle_job(
        &self,
        job: Job,
        bot_id: Uuid,
        session_id: Uuid,
        stats: &mut WorkerStats,
    ) -> Option<SessionEnd> {
        let result = self.executor.execute(&job);

        match self
            .client
            .report(bot_id, session_id, result.job_id, &result.outcome)
            .await
        {
            Ok(ack) => {
                if ack.replayed {
                    tracing::debug!(job_id = %job.id, "Report was a replay");
                }
                match result.outcome {
                    JobOutcome::Success { .. } => stats.jobs_succeeded += 1,
                    JobOutcome::Failure { .. } => stats.jobs_failed += 1,
                }
                None
            }
            Err(FleetError::ClaimConflict { job_id, reason }) => {
                tracing::warn!(job_id = %job_id, reason = %reason, "Result discarded, job no longer ours");
                stats.conflicts += 1;
                None
            }
            Err(FleetError::SessionExpired(_) | FleetError::BotNotFound(_)) => {
                Some(SessionEnd::Expired)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Report failed, lease expiry will return the job");
                None
            }
        }
    }

    /// Sleep for the backoff delay. Returns true if shutdown fired first.
    async fn idle(&self, shutdown: &CancellationToken, streak: u32) -> bool {
        let delay = self.client.retry_policy().delay(streak);
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
