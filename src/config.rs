use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

const DEFAULT_MAX_JOBS: usize = 100_000;

/// Longest lease, session, heartbeat or retention window accepted (one year).
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Largest missed-heartbeat multiplier accepted.
pub const MAX_MISSED_HEARTBEATS: u32 = 10_000;

/// Bot session leases and registration idempotency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session stays valid without a heartbeat.
    pub ttl_secs: u64,
    /// Heartbeat cadence handed to bots at registration.
    pub heartbeat_interval_secs: u64,
    /// How long a registration response is replayed for a repeated key.
    pub idempotency_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            heartbeat_interval_secs: 10,
            idempotency_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Lease granted with each claim. Once it passes, the job is
    /// reclaimable by any bot regardless of the holder's health.
    pub lease_secs: u64,
    /// Queue partition for bots without a queue pin. `None` lets them claim
    /// from every queue.
    pub default_queue: Option<String>,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            default_queue: None,
        }
    }
}

/// Health monitor cadence and missed-heartbeat thresholds.
///
/// Thresholds are multiples of each bot's heartbeat interval: a bot is
/// degraded once its last heartbeat is older than
/// `interval * degraded_after_missed`, and unhealthy (claims released) once
/// it is older than `interval * unhealthy_after_missed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub sweep_interval_ms: u64,
    pub degraded_after_missed: u32,
    pub unhealthy_after_missed: u32,
    /// Succeeded/failed jobs older than this are purged by the sweep.
    /// `None` keeps them forever.
    pub finished_job_retention_secs: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            degraded_after_missed: 3,
            unhealthy_after_missed: 6,
            finished_job_retention_secs: Some(60 * 60),
        }
    }
}

/// Retry envelope bots must honor between failed or empty calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub min_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_ms: 250,
            max_ms: 10_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub claim_rps: u32,
    pub backoff: BackoffPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            claim_rps: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    pub max_jobs: usize,
    pub session: SessionConfig,
    pub claims: ClaimConfig,
    pub health: HealthConfig,
    pub policy: PolicyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_jobs: DEFAULT_MAX_JOBS,
            session: SessionConfig::default(),
            claims: ClaimConfig::default(),
            health: HealthConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == 0 {
            return Err(FleetError::Config("max_jobs must be positive".into()));
        }
        if self.session.ttl_secs == 0 || self.session.heartbeat_interval_secs == 0 {
            return Err(FleetError::Config(
                "session ttl and heartbeat interval must be positive".into(),
            ));
        }
        if self.session.heartbeat_interval_secs > self.session.ttl_secs {
            return Err(FleetError::Config(
                "heartbeat interval must not exceed session ttl".into(),
            ));
        }
        if self.claims.lease_secs == 0 {
            return Err(FleetError::Config("claim lease must be positive".into()));
        }
        let windows = [
            ("session.ttl_secs", Some(self.session.ttl_secs)),
            (
                "session.heartbeat_interval_secs",
                Some(self.session.heartbeat_interval_secs),
            ),
            (
                "session.idempotency_ttl_secs",
                Some(self.session.idempotency_ttl_secs),
            ),
            ("claims.lease_secs", Some(self.claims.lease_secs)),
            (
                "health.finished_job_retention_secs",
                self.health.finished_job_retention_secs,
            ),
        ];
        for (name, secs) in windows {
            if secs.is_some_and(|secs| secs > MAX_WINDOW_SECS) {
                return Err(FleetError::Config(format!(
                    "{} must be at most {} seconds",
                    name, MAX_WINDOW_SECS
                )));
            }
        }
        if self.health.sweep_interval_ms == 0 {
            return Err(FleetError::Config("sweep interval must be positive".into()));
        }
        if self.health.degraded_after_missed == 0
            || self.health.unhealthy_after_missed <= self.health.degraded_after_missed
        {
            return Err(FleetError::Config(
                "unhealthy threshold must be greater than a non-zero degraded threshold".into(),
            ));
        }
        if self.health.unhealthy_after_missed > MAX_MISSED_HEARTBEATS {
            return Err(FleetError::Config(format!(
                "unhealthy_after_missed must be at most {}",
                MAX_MISSED_HEARTBEATS
            )));
        }
        let backoff = &self.policy.backoff;
        if backoff.min_ms == 0 || backoff.min_ms > backoff.max_ms {
            return Err(FleetError::Config(
                "backoff requires 0 < min_ms <= max_ms".into(),
            ));
        }
        Ok(())
    }
}
