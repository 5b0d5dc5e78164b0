use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::fleet::sessions::HeartbeatAck;
use crate::fleet::{RegistrationRequest, RegistrationResponse};
use crate::orchestrator::Orchestrator;
use crate::scheduler::{ClaimOutcome, JobOutcome, ReportAck};
use crate::worker::resilience::BotTransport;

/// In-process transport: calls the orchestrator directly.
///
/// Used by `server --local-bots` and by tests that drive a full bot loop
/// without a network hop.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    orchestrator: Orchestrator,
}

impl LocalTransport {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl BotTransport for LocalTransport {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        self.orchestrator.register(request.clone()).await
    }

    async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck> {
        self.orchestrator.heartbeat(bot_id, session_id).await
    }

    async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome> {
        self.orchestrator.claim(bot_id, session_id).await
    }

    async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<ReportAck> {
        self.orchestrator
            .report(bot_id, session_id, job_id, outcome.clone())
            .await
    }
}
