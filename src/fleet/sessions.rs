use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::config::{BackoffPolicy, OrchestratorConfig, PolicyConfig, SessionConfig};
use crate::error::{FleetError, Result};
use crate::fleet::bot::{AgentInfo, Bot, Capabilities, HealthStatus};
use crate::fleet::idempotency::{IdempotencyKey, IdempotencyStore};
use crate::fleet::registry::BotRegistry;
use crate::operations::OperationRegistry;

const REGISTER_ENDPOINT: &str = "register";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub bot_key: String,
    pub instance_id: String,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl RegistrationRequest {
    pub fn new(bot_key: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            bot_key: bot_key.into(),
            instance_id: instance_id.into(),
            agent: AgentInfo::default(),
            capabilities: Capabilities::default(),
            idempotency_key: None,
        }
    }

    pub fn with_capabilities(mut self, operations: &[&str], max_concurrency: u32) -> Self {
        self.capabilities = Capabilities {
            operations: operations.iter().map(|s| s.to_string()).collect(),
            max_concurrency,
        };
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Identifies the body that produced a cached response.
    fn fingerprint(&self) -> String {
        serde_json::to_string(&(&self.instance_id, &self.agent, &self.capabilities))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: Uuid,
    pub expires_in_sec: u64,
    pub heartbeat_interval_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub operation: Option<String>,
    pub queue: Option<String>,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub claim_rps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotPolicy {
    pub rate_limits: RateLimits,
    pub backoff: BackoffPolicy,
}

impl From<&PolicyConfig> for BotPolicy {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            rate_limits: RateLimits {
                claim_rps: policy.claim_rps,
            },
            backoff: policy.backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub heartbeat: String,
    pub claim: String,
    pub report: String,
}

impl Endpoints {
    pub fn for_bot(bot_id: Uuid) -> Self {
        Self {
            heartbeat: format!("/v1/bots/{}/heartbeat", bot_id),
            claim: format!("/v1/bots/{}/claim", bot_id),
            report: format!("/v1/bots/{}/report", bot_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub bot_id: Uuid,
    pub registered_at: DateTime<Utc>,
    pub session: SessionGrant,
    pub assignment: Assignment,
    pub policy: BotPolicy,
    pub endpoints: Endpoints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub ok: bool,
    pub expires_in_sec: u64,
    pub health_status: HealthStatus,
    pub assignment: Assignment,
}

/// Bot identity, session leases and heartbeat renewal.
#[derive(Debug)]
pub struct SessionManager {
    bots: Arc<BotRegistry>,
    operations: Arc<OperationRegistry>,
    idempotency: Arc<IdempotencyStore<RegistrationResponse>>,
    session: SessionConfig,
    policy: BotPolicy,
    default_queue: Option<String>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        config: &OrchestratorConfig,
        bots: Arc<BotRegistry>,
        operations: Arc<OperationRegistry>,
        idempotency: Arc<IdempotencyStore<RegistrationResponse>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bots,
            operations,
            idempotency,
            session: config.session.clone(),
            policy: BotPolicy::from(&config.policy),
            default_queue: config.claims.default_queue.clone(),
            clock,
        }
    }

    fn session_ttl(&self) -> Duration {
        clock::seconds(self.session.ttl_secs)
    }

    /// Register (or re-register) a bot and issue it a fresh session.
    ///
    /// Keyed by (`bot_key`, `instance_id`): a known identity keeps its id,
    /// operator pins and claims, but its previous session stops being
    /// accepted and an operation adopted during that session is dropped. A
    /// repeated `idempotency_key` replays the first response verbatim with
    /// no side effects.
    pub async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        self.validate(&request)?;

        let Some(key) = request
            .idempotency_key
            .as_ref()
            .map(|k| IdempotencyKey::new(REGISTER_ENDPOINT, request.bot_key.clone(), k.clone()))
        else {
            return self.admit(&request, self.clock.now()).await;
        };

        // Held until the response is cached so concurrent retries of the
        // same key cannot both admit.
        let mut cache = self.idempotency.lock().await;
        let now = self.clock.now();
        if let Some(record) = cache.lookup(&key, now) {
            if record.fingerprint != request.fingerprint() {
                tracing::warn!(
                    bot_key = %request.bot_key,
                    idempotency_key = %key.key,
                    "Idempotency key reused with a different body, replaying first response"
                );
            }
            tracing::debug!(bot_key = %request.bot_key, "Replaying cached registration");
            return Ok(record.response.clone());
        }

        let response = self.admit(&request, now).await?;
        cache.remember(key, response.clone(), request.fingerprint(), now);
        Ok(response)
    }

    async fn admit(
        &self,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> Result<RegistrationResponse> {
        let session_id = Uuid::new_v4();
        let expires_at = now + self.session_ttl();
        let heartbeat_interval_sec = self.session.heartbeat_interval_secs;
        let fresh = Bot {
            id: Uuid::new_v4(),
            bot_key: request.bot_key.clone(),
            instance_id: request.instance_id.clone(),
            agent: request.agent.clone(),
            capabilities: request.capabilities.clone(),
            assigned_operation: None,
            operation_pinned: false,
            queue: None,
            session_id,
            session_expires_at: expires_at,
            heartbeat_interval_sec,
            last_heartbeat_at: now,
            health_status: HealthStatus::Healthy,
            active_claims: 0,
            registered_at: now,
            updated_at: now,
        };

        let bot = self
            .bots
            .upsert(fresh, |existing| {
                existing.agent = request.agent.clone();
                existing.capabilities = request.capabilities.clone();
                if !existing.operation_pinned {
                    existing.assigned_operation = None;
                }
                existing.session_id = session_id;
                existing.session_expires_at = expires_at;
                existing.heartbeat_interval_sec = heartbeat_interval_sec;
                existing.last_heartbeat_at = now;
                existing.health_status = HealthStatus::Healthy;
                existing.updated_at = now;
            })
            .await?;

        tracing::info!(
            bot_id = %bot.id,
            bot_key = %bot.bot_key,
            instance_id = %bot.instance_id,
            session_id = %session_id,
            max_concurrency = bot.capabilities.max_concurrency,
            "Bot registered"
        );

        Ok(RegistrationResponse {
            bot_id: bot.id,
            registered_at: bot.registered_at,
            session: SessionGrant {
                session_id,
                expires_in_sec: self.session.ttl_secs,
                heartbeat_interval_sec,
            },
            assignment: self.assignment_for(&bot),
            policy: self.policy,
            endpoints: Endpoints::for_bot(bot.id),
        })
    }

    /// Renew the session lease. A superseded session is rejected; the bot
    /// must re-register rather than retry.
    pub async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck> {
        let now = self.clock.now();
        let ttl = self.session_ttl();
        let (previous, bot) = self
            .bots
            .update(bot_id, |bot| {
                bot.check_session(session_id)?;
                let previous = bot.health_status;
                bot.renew_session(ttl, now);
                Ok((previous, bot.clone()))
            })
            .await?;

        if previous != HealthStatus::Healthy {
            tracing::info!(bot_id = %bot_id, previous = %previous, "Bot recovered on heartbeat");
        } else {
            tracing::trace!(bot_id = %bot_id, "Heartbeat");
        }

        Ok(HeartbeatAck {
            ok: true,
            expires_in_sec: self.session.ttl_secs,
            health_status: bot.health_status,
            assignment: self.assignment_for(&bot),
        })
    }

    /// Pin the bot to `operation`, or unpin it with `None`. A pin outlives
    /// re-registration. Jobs the bot already holds are unaffected.
    pub async fn assign_operation(&self, bot_id: Uuid, operation: Option<String>) -> Result<Bot> {
        if let Some(op) = &operation {
            self.operations.resolve(op)?;
        }
        let now = self.clock.now();
        let bot = self
            .bots
            .update(bot_id, |bot| {
                bot.assigned_operation = operation.clone();
                bot.operation_pinned = operation.is_some();
                bot.updated_at = now;
                Ok(bot.clone())
            })
            .await?;
        tracing::info!(bot_id = %bot_id, operation = ?operation, "Bot operation assignment changed");
        Ok(bot)
    }

    /// Restrict the bot to one queue partition, or lift the restriction.
    pub async fn assign_queue(&self, bot_id: Uuid, queue: Option<String>) -> Result<Bot> {
        let now = self.clock.now();
        let bot = self
            .bots
            .update(bot_id, |bot| {
                bot.queue = queue.clone();
                bot.updated_at = now;
                Ok(bot.clone())
            })
            .await?;
        tracing::info!(bot_id = %bot_id, queue = ?queue, "Bot queue assignment changed");
        Ok(bot)
    }

    pub fn assignment_for(&self, bot: &Bot) -> Assignment {
        Assignment {
            operation: bot.assigned_operation.clone(),
            queue: bot.queue.clone().or_else(|| self.default_queue.clone()),
            max_concurrency: bot.capabilities.max_concurrency,
        }
    }

    fn validate(&self, request: &RegistrationRequest) -> Result<()> {
        if request.bot_key.trim().is_empty() {
            return Err(FleetError::InvalidRequest("bot_key must not be empty".into()));
        }
        if request.instance_id.trim().is_empty() {
            return Err(FleetError::InvalidRequest(
                "instance_id must not be empty".into(),
            ));
        }
        if request.capabilities.max_concurrency == 0 {
            return Err(FleetError::InvalidRequest(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if let Some(unknown) = request
            .capabilities
            .operations
            .iter()
            .find(|op| !self.operations.contains(op))
        {
            return Err(FleetError::UnknownOperation(unknown.clone()));
        }
        Ok(())
    }
}
