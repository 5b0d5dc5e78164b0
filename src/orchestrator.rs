use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{self, Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::fleet::idempotency::IdempotencyStore;
use crate::fleet::sessions::HeartbeatAck;
use crate::fleet::{
    Bot, BotRegistry, HealthMonitor, RegistrationRequest, RegistrationResponse, SessionManager,
};
use crate::operations::{OperationInfo, OperationRegistry};
use crate::scheduler::store::JobCounts;
use crate::scheduler::{
    ClaimCoordinator, ClaimOutcome, Job, JobOutcome, JobStatus, JobStore, ReleaseReason,
    ReportAck,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueBatch {
    pub operation: String,
    pub args: Vec<Vec<i64>>,
    #[serde(default)]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub jobs: JobCounts,
    pub bots: usize,
}

/// Everything a bot or operator talks to, wired over shared tables.
///
/// Cheap to clone; all state lives behind `Arc`s.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    operations: Arc<OperationRegistry>,
    jobs: Arc<JobStore>,
    bots: Arc<BotRegistry>,
    idempotency: Arc<IdempotencyStore<RegistrationResponse>>,
    sessions: Arc<SessionManager>,
    coordinator: Arc<ClaimCoordinator>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, operations: OperationRegistry) -> Result<Self> {
        Self::with_clock(config, operations, Arc::new(SystemClock))
    }

    /// Fails with `Config` if `config` does not validate.
    pub fn with_clock(
        config: OrchestratorConfig,
        operations: OperationRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let operations = Arc::new(operations);
        let jobs = Arc::new(JobStore::with_capacity(config.max_jobs, clock.clone()));
        let bots = Arc::new(BotRegistry::new());
        let idempotency = Arc::new(IdempotencyStore::new(clock::seconds(
            config.session.idempotency_ttl_secs,
        )));
        let sessions = Arc::new(SessionManager::new(
            &config,
            bots.clone(),
            operations.clone(),
            idempotency.clone(),
            clock.clone(),
        ));
        let coordinator = Arc::new(ClaimCoordinator::new(
            jobs.clone(),
            bots.clone(),
            clock::seconds(config.claims.lease_secs),
            config.claims.default_queue.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            operations,
            jobs,
            bots,
            idempotency,
            sessions,
            coordinator,
            clock,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn bots(&self) -> &Arc<BotRegistry> {
        &self.bots
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.jobs.clone(),
            self.bots.clone(),
            self.idempotency.clone(),
            self.config.health.clone(),
            self.clock.clone(),
        )
    }

    // Bot-facing calls.

    pub async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        self.sessions.register(request).await
    }

    pub async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck> {
        self.sessions.heartbeat(bot_id, session_id).await
    }

    pub async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome> {
        self.coordinator.claim(bot_id, session_id).await
    }

    pub async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<ReportAck> {
        self.coordinator
            .report(bot_id, session_id, job_id, outcome)
            .await
    }

    // Admin surface.

    pub fn list_operations(&self) -> Vec<OperationInfo> {
        self.operations.list()
    }

    pub async fn enqueue(
        &self,
        operation: &str,
        args: Vec<i64>,
        queue: Option<String>,
    ) -> Result<Job> {
        self.operations.resolve(operation)?;
        self.jobs.enqueue(operation, args, queue).await
    }

    /// Enqueue one job per argument list, all for the same operation.
    /// Either the whole batch is queued or none of it is.
    pub async fn enqueue_batch(&self, batch: EnqueueBatch) -> Result<Vec<Job>> {
        self.operations.resolve(&batch.operation)?;
        if batch.args.is_empty() {
            return Err(FleetError::InvalidRequest("batch has no jobs".into()));
        }
        let jobs = self
            .jobs
            .enqueue_many(&batch.operation, batch.args, batch.queue.clone())
            .await?;
        tracing::info!(operation = %batch.operation, count = jobs.len(), "Jobs enqueued");
        Ok(jobs)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.jobs.get(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.jobs.list(status).await
    }

    pub async fn release_job(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        self.coordinator
            .release(job_id, ReleaseReason::Requested)
            .await
    }

    pub async fn list_bots(&self) -> Result<Vec<Bot>> {
        self.bots.list().await
    }

    pub async fn get_bot(&self, bot_id: Uuid) -> Result<Bot> {
        self.bots.get(bot_id).await
    }

    pub async fn assign_operation(&self, bot_id: Uuid, operation: Option<String>) -> Result<Bot> {
        self.sessions.assign_operation(bot_id, operation).await
    }

    pub async fn assign_queue(&self, bot_id: Uuid, queue: Option<String>) -> Result<Bot> {
        self.sessions.assign_queue(bot_id, queue).await
    }

    pub async fn stats(&self) -> Result<FleetStats> {
        Ok(FleetStats {
            jobs: self.jobs.counts().await?,
            bots: self.bots.len().await,
        })
    }
}
