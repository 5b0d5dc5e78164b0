use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::config::HealthConfig;
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Health implied by how long ago the last heartbeat arrived.
    ///
    /// A threshold too large to represent is never reached.
    pub fn for_heartbeat_age(age: Duration, interval: Duration, config: &HealthConfig) -> Self {
        let past = |missed: u32| {
            i32::try_from(missed)
                .ok()
                .and_then(|n| interval.checked_mul(n))
                .is_some_and(|threshold| age > threshold)
        };
        if past(config.unhealthy_after_missed) {
            HealthStatus::Unhealthy
        } else if past(config.degraded_after_missed) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Operations this bot can execute. Empty means any.
    #[serde(default)]
    pub operations: Vec<String>,
    pub max_concurrency: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            max_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub bot_key: String,
    pub instance_id: String,
    pub agent: AgentInfo,
    pub capabilities: Capabilities,
    /// Pinned or adopted operation. `None` adopts on the first claim.
    pub assigned_operation: Option<String>,
    /// Set by an operator pin. An adopted operation leaves this false and
    /// only lasts for the session that adopted it.
    #[serde(default)]
    pub operation_pinned: bool,
    pub queue: Option<String>,
    pub session_id: Uuid,
    pub session_expires_at: DateTime<Utc>,
    pub heartbeat_interval_sec: u64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub active_claims: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn heartbeat_interval(&self) -> Duration {
        clock::seconds(self.heartbeat_interval_sec)
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat_at
    }

    /// The presented session must be the bot's current one.
    pub fn check_session(&self, session_id: Uuid) -> Result<()> {
        if self.session_id != session_id {
            return Err(FleetError::SessionExpired(self.id));
        }
        Ok(())
    }

    /// Current session and not yet past its expiry.
    pub fn check_live_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.check_session(session_id)?;
        if self.session_expires_at <= now {
            return Err(FleetError::SessionExpired(self.id));
        }
        Ok(())
    }

    pub fn has_capacity(&self) -> bool {
        self.active_claims < self.capabilities.max_concurrency
    }

    /// Take one unit of claim capacity. Fails when already at the limit.
    pub(crate) fn reserve_claim(&mut self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.active_claims += 1;
        true
    }

    pub(crate) fn release_claims(&mut self, count: u32) {
        self.active_claims = self.active_claims.saturating_sub(count);
    }

    pub(crate) fn renew_session(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.session_expires_at = now + ttl;
        self.last_heartbeat_at = now;
        self.health_status = HealthStatus::Healthy;
        self.updated_at = now;
    }
}
