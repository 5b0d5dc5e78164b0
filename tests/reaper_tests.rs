
use botfleet::config::OrchestratorConfig;
use botfleet::error::FleetError;
use botfleet::fleet::HealthStatus;
use botfleet::operations::OperationRegistry;
use botfleet::scheduler::{JobOutcome, JobStatus, ReleaseReason};
use botfleet::Orchestrator;

use test_harness::{test_clock, test_config, Harness};

/// Leases long enough that only the health path can reclaim work.
fn long_lease_config() -> OrchestratorConfig {
    let mut config = test_config();
    config.claims.lease_secs = 3600;
    config
}

#[tokio::test]
async fn test_unhealthy_bot_claims_return_to_pending() {
    let h = Harness::with_config(long_lease_config());
    let mut jobs = Vec::new();
    for i in 0..3 {
        jobs.push(h.enqueue("sum", &[i, 10]).await);
    }
    let crashed = h.register("fleet", "crashed", &[], 3).await;
    for _ in 0..3 {
        h.claim_job(&crashed).await;
    }
    assert_eq!(h.active_claims(&crashed).await, 3);

    let survivor = h.register("fleet", "survivor", &[], 3).await;
    let monitor = h.orchestrator.health_monitor();

    // 35 s of silence: degraded, claims untouched.
    h.advance_secs(35);
    h.orchestrator
        .heartbeat(survivor.bot_id, survivor.session_id)
        .await
        .unwrap();
    let report = monitor.sweep().await.unwrap();
    assert_eq!(report.bots_degraded, 1);
    assert_eq!(report.jobs_released, 0);
    assert_eq!(h.active_claims(&crashed).await, 3);

    // 65 s: unhealthy, every claim released.
    h.advance_secs(30);
    h.orchestrator
        .heartbeat(survivor.bot_id, survivor.session_id)
        .await
        .unwrap();
    let report = monitor.sweep().await.unwrap();
    assert_eq!(report.bots_unhealthy, 1);
    assert_eq!(report.jobs_released, 3);

    let bot = h.orchestrator.get_bot(crashed.bot_id).await.unwrap();
    assert_eq!(bot.health_status, HealthStatus::Unhealthy);
    assert_eq!(bot.active_claims, 0);

    for job in &jobs {
        let stored = h.orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.claimed_by.is_none());
        assert!(stored.claim_expires_at.is_none());
        assert_eq!(stored.last_release, Some(ReleaseReason::BotUnhealthy));
    }

    // Another bot picks them all up, oldest first.
    for job in &jobs {
        let claimed = h.claim_job(&survivor).await;
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 2);
    }
}

#[tokio::test]
async fn test_report_after_health_release_is_conflict() {
    let h = Harness::with_config(long_lease_config());
    let job = h.enqueue("sum", &[4, 5]).await;
    let bot = h.register("fleet", "silent", &[], 1).await;
    h.claim_job(&bot).await;

    h.advance_secs(61);
    let report = h.orchestrator.health_monitor().sweep().await.unwrap();
    assert_eq!(report.jobs_released, 1);

    // The bot wakes up and reports on its still-current session.
    let err = h
        .orchestrator
        .report(
            bot.bot_id,
            bot.session_id,
            job.id,
            JobOutcome::Success { result: 9 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::ClaimConflict { job_id, .. } if job_id == job.id));

    let stored = h.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.result.is_none());
    assert_eq!(h.active_claims(&bot).await, 0);
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let h = Harness::with_config(long_lease_config());
    h.enqueue("sum", &[1, 1]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;

    h.advance_secs(61);
    let monitor = h.orchestrator.health_monitor();
    let first = monitor.sweep().await.unwrap();
    assert_eq!(first.bots_unhealthy, 1);
    assert_eq!(first.jobs_released, 1);

    let second = monitor.sweep().await.unwrap();
    assert_eq!(second.bots_unhealthy, 0);
    assert_eq!(second.jobs_released, 0);
    assert_eq!(h.active_claims(&bot).await, 0);
}

#[tokio::test]
async fn test_resweep_spares_jobs_reclaimed_by_other_bots() {
    let h = Harness::with_config(long_lease_config());
    let job = h.enqueue("sum", &[1, 1]).await;
    let crashed = h.register("fleet", "crashed", &[], 1).await;
    h.claim_job(&crashed).await;

    let monitor = h.orchestrator.health_monitor();
    h.advance_secs(61);
    monitor.sweep().await.unwrap();

    let other = h.register("fleet", "other", &[], 1).await;
    h.claim_job(&other).await;

    // A re-run after the job changed hands must not touch it.
    monitor.sweep().await.unwrap();
    let stored = h.orchestrator.get_job(job.id).await.unwrap();
    assert!(stored.is_held_by(other.bot_id));
    assert_eq!(h.active_claims(&other).await, 1);
}

#[tokio::test]
async fn test_lease_expiry_reclaims_before_health() {
    // Default lease (30 s) is shorter than the unhealthy window (60 s).
    let h = Harness::new();
    let job = h.enqueue("multiply", &[6, 7]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;

    h.advance_secs(31);
    let report = h.orchestrator.health_monitor().sweep().await.unwrap();
    assert_eq!(report.leases_expired, 1);
    assert_eq!(report.bots_degraded, 1);
    assert_eq!(report.jobs_released, 0);

    let stored = h.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.last_release, Some(ReleaseReason::LeaseExpired));
    assert_eq!(h.active_claims(&bot).await, 0);
}

#[tokio::test]
async fn test_healthy_bot_is_left_alone() {
    let h = Harness::with_config(long_lease_config());
    h.enqueue("sum", &[1, 1]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;
    let monitor = h.orchestrator.health_monitor();

    for _ in 0..10 {
        h.advance_secs(10);
        h.orchestrator
            .heartbeat(bot.bot_id, bot.session_id)
            .await
            .unwrap();
        let report = monitor.sweep().await.unwrap();
        assert!(report.is_quiet(), "unexpected sweep activity: {:?}", report);
    }
    assert_eq!(h.active_claims(&bot).await, 1);
}

#[test]
fn test_unbounded_thresholds_are_rejected_at_startup() {
    let mut config = test_config();
    config.health.unhealthy_after_missed = 3_000_000_000;
    let err = Orchestrator::with_clock(config, OperationRegistry::with_defaults(), test_clock())
        .unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));

    let mut config = test_config();
    config.claims.lease_secs = u64::MAX;
    assert!(
        Orchestrator::with_clock(config, OperationRegistry::with_defaults(), test_clock()).is_err()
    );
}

#[tokio::test]
async fn test_silent_bot_can_jump_straight_to_unhealthy() {
    let h = Harness::with_config(long_lease_config());
    let bot = h.register("fleet", "a", &[], 1).await;

    h.advance_secs(120);
    let report = h.orchestrator.health_monitor().sweep().await.unwrap();
    assert_eq!(report.bots_degraded, 0);
    assert_eq!(report.bots_unhealthy, 1);
    assert_eq!(
        h.orchestrator.get_bot(bot.bot_id).await.unwrap().health_status,
        HealthStatus::Unhealthy
    );
}

#[tokio::test]
async fn test_sweep_purges_old_finished_jobs() {
    let h = Harness::new();
    let job = h.enqueue("sum", &[2, 3]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;
    h.orchestrator
        .report(
            bot.bot_id,
            bot.session_id,
            job.id,
            JobOutcome::Success { result: 5 },
        )
        .await
        .unwrap();

    let monitor = h.orchestrator.health_monitor();
    h.advance_secs(1800);
    assert_eq!(monitor.sweep().await.unwrap().jobs_purged, 0);

    h.advance_secs(1801);
    assert_eq!(monitor.sweep().await.unwrap().jobs_purged, 1);
    assert!(h.orchestrator.get_job(job.id).await.is_err());
}

#[tokio::test]
async fn test_sweep_evicts_expired_idempotency_records() {
    let h = Harness::new();
    h.orchestrator
        .register(
            botfleet::fleet::RegistrationRequest::new("fleet", "a").with_idempotency_key("k"),
        )
        .await
        .unwrap();

    h.advance_secs(24 * 3600 + 1);
    let report = h.orchestrator.health_monitor().sweep().await.unwrap();
    assert_eq!(report.idempotency_evicted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_task_stops_on_shutdown() {
    let h = Harness::new();
    let token = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(h.orchestrator.health_monitor().run(token.clone()));

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    token.cancel();
    handle.await.unwrap();
}
