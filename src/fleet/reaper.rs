use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::fleet::bot::HealthStatus;
use crate::fleet::idempotency::IdempotencyStore;
use crate::fleet::registry::BotRegistry;
use crate::fleet::sessions::RegistrationResponse;
use crate::scheduler::job::ReleaseReason;
use crate::scheduler::store::JobStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub leases_expired: usize,
    pub bots_degraded: usize,
    pub bots_unhealthy: usize,
    pub jobs_released: usize,
    pub idempotency_evicted: usize,
    pub jobs_purged: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Periodic sweep that reclaims work from bots that stopped reporting.
///
/// Two reclaim paths share the same conditional release (`status = claimed`
/// and `claimed_by = bot`):
///
/// 1. **Lease expiry**: any claim past `claim_expires_at` goes back to
///    pending, whatever the holder's health.
/// 2. **Bot health**: a bot whose last heartbeat is older than
///    `interval * degraded_after_missed` is degraded, older than
///    `interval * unhealthy_after_missed` unhealthy. Every claim held by an
///    unhealthy bot is released.
///
/// A sweep holds no lock across the bot scan. It can be interrupted at any
/// point and re-run: unhealthy bots that still hold claims are swept again,
/// and a job another bot has since claimed no longer matches the predicate.
#[derive(Debug)]
pub struct HealthMonitor {
    jobs: Arc<JobStore>,
    bots: Arc<BotRegistry>,
    idempotency: Arc<IdempotencyStore<RegistrationResponse>>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(
        jobs: Arc<JobStore>,
        bots: Arc<BotRegistry>,
        idempotency: Arc<IdempotencyStore<RegistrationResponse>>,
        config: HealthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            bots,
            idempotency,
            config,
            clock,
        }
    }

    /// Run sweeps on a fixed interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.sweep_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.config.sweep_interval_ms, "Health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) if !report.is_quiet() => {
                            tracing::info!(?report, "Health sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Health sweep failed");
                        }
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for released in self.jobs.release_expired().await? {
            self.bots.release_claims(released.bot_id, 1).await?;
            report.leases_expired += 1;
        }

        for bot_id in self.bots.ids().await {
            let Some(transition) = self.evaluate(bot_id).await? else {
                continue;
            };
            match transition.to {
                HealthStatus::Degraded if transition.changed => report.bots_degraded += 1,
                HealthStatus::Unhealthy if transition.changed => report.bots_unhealthy += 1,
                _ => {}
            }
            if transition.to == HealthStatus::Unhealthy && transition.needs_release {
                report.jobs_released += self.release_unhealthy(bot_id, &transition).await?;
            }
        }

        let now = self.clock.now();
        report.idempotency_evicted = self.idempotency.evict_expired(now).await;

        if let Some(retention) = self.config.finished_job_retention_secs {
            report.jobs_purged = self
                .jobs
                .purge_finished(now - clock::seconds(retention))
                .await?;
        }

        Ok(report)
    }

    /// Demote the bot if its heartbeat is overdue. Health only moves
    /// forward here; a heartbeat is the only way back to healthy.
    async fn evaluate(&self, bot_id: Uuid) -> Result<Option<Transition>> {
        let now = self.clock.now();
        let config = &self.config;
        self.bots
            .update(bot_id, |bot| {
                let target = HealthStatus::for_heartbeat_age(
                    bot.heartbeat_age(now),
                    bot.heartbeat_interval(),
                    config,
                );
                let from = bot.health_status;
                if target <= from {
                    if from == HealthStatus::Unhealthy {
                        return Ok(Some(Transition {
                            to: from,
                            changed: false,
                            needs_release: bot.active_claims > 0,
                            last_heartbeat_at: bot.last_heartbeat_at,
                        }));
                    }
                    return Ok(None);
                }

                bot.health_status = target;
                bot.updated_at = now;
                tracing::warn!(
                    bot_id = %bot.id,
                    from = %from,
                    to = %target,
                    last_heartbeat_at = %bot.last_heartbeat_at,
                    active_claims = bot.active_claims,
                    "Bot health demoted"
                );
                Ok(Some(Transition {
                    to: target,
                    changed: true,
                    needs_release: true,
                    last_heartbeat_at: bot.last_heartbeat_at,
                }))
            })
            .await
    }

    /// Release the claims of a bot judged unhealthy by `transition`, unless
    /// it has heartbeated since.
    async fn release_unhealthy(&self, bot_id: Uuid, transition: &Transition) -> Result<usize> {
        let still_silent = self
            .bots
            .update(bot_id, |bot| {
                Ok(bot.health_status == HealthStatus::Unhealthy
                    && bot.last_heartbeat_at == transition.last_heartbeat_at)
            })
            .await?;
        if !still_silent {
            tracing::info!(bot_id = %bot_id, "Bot heartbeated before release, claims kept");
            return Ok(0);
        }

        let released = self
            .jobs
            .release_claims_of(bot_id, ReleaseReason::BotUnhealthy)
            .await?;
        let count = u32::try_from(released.len()).unwrap_or(u32::MAX);
        self.bots.release_claims(bot_id, count).await?;
        Ok(released.len())
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    to: HealthStatus,
    changed: bool,
    needs_release: bool,
    last_heartbeat_at: DateTime<Utc>,
}
