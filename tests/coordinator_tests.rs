
use std::sync::Arc;

use botfleet::error::FleetError;
use botfleet::fleet::HealthStatus;
use botfleet::scheduler::{ClaimOutcome, JobOutcome, JobStatus};

use test_harness::Harness;

#[tokio::test]
async fn test_unpinned_bot_adopts_first_claimed_operation() {
    let h = Harness::new();
    let multiply = h.enqueue("multiply", &[2, 3]).await;
    let sum = h.enqueue("sum", &[1, 1]).await;
    let multiply_again = h.enqueue("multiply", &[4, 5]).await;

    let bot = h.register("fleet", "a", &[], 4).await;
    let first = h.claim_job(&bot).await;
    assert_eq!(first.id, multiply.id);

    let stored = h.orchestrator.get_bot(bot.bot_id).await.unwrap();
    assert_eq!(stored.assigned_operation.as_deref(), Some("multiply"));

    // The adopted operation now filters claims: sum is skipped.
    let second = h.claim_job(&bot).await;
    assert_eq!(second.id, multiply_again.id);

    let outcome = h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::NoneAvailable);
    assert_eq!(h.active_claims(&bot).await, 2);

    let other = h.register("fleet", "b", &[], 1).await;
    assert_eq!(h.claim_job(&other).await.id, sum.id);
}

#[tokio::test]
async fn test_pinned_bot_only_claims_its_operation() {
    let h = Harness::new();
    h.enqueue("sum", &[1, 2]).await;
    let bot = h.register("fleet", "a", &[], 1).await;

    h.orchestrator
        .assign_operation(bot.bot_id, Some("divide".into()))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator
            .claim(bot.bot_id, bot.session_id)
            .await
            .unwrap(),
        ClaimOutcome::NoneAvailable
    );

    let divide = h.enqueue("divide", &[10, 3]).await;
    assert_eq!(h.claim_job(&bot).await.id, divide.id);

    let unknown = h
        .orchestrator
        .assign_operation(bot.bot_id, Some("modulo".into()))
        .await
        .unwrap_err();
    assert_eq!(unknown, FleetError::UnknownOperation("modulo".into()));
}

#[tokio::test]
async fn test_capacity_is_never_exceeded() {
    let h = Harness::new();
    for i in 0..5 {
        h.enqueue("sum", &[i, i]).await;
    }
    let bot = h.register("fleet", "a", &[], 2).await;

    h.claim_job(&bot).await;
    let second = h.claim_job(&bot).await;
    let outcome = h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Redelivered { job: second });
    assert_eq!(h.active_claims(&bot).await, 2);
    assert_eq!(h.orchestrator.stats().await.unwrap().jobs.pending, 3);
}

#[tokio::test]
async fn test_repeated_claim_hands_back_held_job() {
    let h = Harness::new();
    let first = h.enqueue("sum", &[1, 2]).await;
    let next = h.enqueue("sum", &[3, 4]).await;
    let bot = h.register("fleet", "a", &[], 1).await;

    // The response to this claim never reaches the bot.
    h.orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap();

    let retried = h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap();
    let ClaimOutcome::Redelivered { job } = retried else {
        panic!("expected the held job back, got {:?}", retried);
    };
    assert_eq!(job.id, first.id);
    assert_eq!(job.attempts, 1);
    assert_eq!(h.active_claims(&bot).await, 1);
    assert_eq!(
        h.orchestrator.get_job(next.id).await.unwrap().status,
        JobStatus::Pending
    );

    h.orchestrator
        .report(
            bot.bot_id,
            bot.session_id,
            job.id,
            JobOutcome::Success { result: 3 },
        )
        .await
        .unwrap();
    assert_eq!(h.claim_job(&bot).await.id, next.id);
}

#[tokio::test]
async fn test_expired_lease_is_not_redelivered() {
    let h = Harness::new();
    h.enqueue("sum", &[1, 2]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;

    // Lease gone, session still live, no sweep yet.
    h.advance_secs(31);
    assert_eq!(
        h.orchestrator
            .claim(bot.bot_id, bot.session_id)
            .await
            .unwrap(),
        ClaimOutcome::AtCapacity
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_respect_capacity() {
    let h = Harness::new();
    for i in 0..20 {
        h.enqueue("sum", &[i, 1]).await;
    }
    let bot = h.register("fleet", "a", &[], 3).await;
    let orchestrator = Arc::new(h.orchestrator.clone());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.claim(bot.bot_id, bot.session_id).await.unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if let ClaimOutcome::Claimed { .. } = handle.await.unwrap() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 3);
    assert_eq!(h.active_claims(&bot).await, 3);
}

#[tokio::test]
async fn test_report_frees_capacity_and_replays() {
    let h = Harness::new();
    let job = h.enqueue("divide", &[10, 3]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;

    let outcome = JobOutcome::Success { result: 3 };
    let ack = h
        .orchestrator
        .report(bot.bot_id, bot.session_id, job.id, outcome.clone())
        .await
        .unwrap();
    assert!(ack.ok);
    assert!(!ack.replayed);
    assert_eq!(h.active_claims(&bot).await, 0);

    let replay = h
        .orchestrator
        .report(bot.bot_id, bot.session_id, job.id, outcome)
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(h.active_claims(&bot).await, 0);

    let stored = h.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.result, Some(3));
    assert_eq!(stored.completed_by, Some(bot.bot_id));
}

#[tokio::test]
async fn test_lost_lease_reports_conflict() {
    let h = Harness::new();
    let job = h.enqueue("sum", &[2, 2]).await;
    let slow = h.register("fleet", "slow", &[], 1).await;
    let fast = h.register("fleet", "fast", &[], 1).await;
    h.claim_job(&slow).await;

    // The lease (30 s) runs out while both bots keep heartbeating.
    h.advance_secs(31);
    h.orchestrator
        .heartbeat(slow.bot_id, slow.session_id)
        .await
        .unwrap();
    h.orchestrator
        .heartbeat(fast.bot_id, fast.session_id)
        .await
        .unwrap();

    let retaken = h.claim_job(&fast).await;
    assert_eq!(retaken.id, job.id);
    assert_eq!(retaken.attempts, 2);
    assert_eq!(h.active_claims(&slow).await, 0);

    let err = h
        .orchestrator
        .report(
            slow.bot_id,
            slow.session_id,
            job.id,
            JobOutcome::Success { result: 4 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::ClaimConflict { job_id, .. } if job_id == job.id));

    h.orchestrator
        .report(
            fast.bot_id,
            fast.session_id,
            job.id,
            JobOutcome::Success { result: 4 },
        )
        .await
        .unwrap();
    assert_eq!(h.active_claims(&fast).await, 0);
}

#[tokio::test]
async fn test_claim_requires_live_session_and_health() {
    let h = Harness::new();
    h.enqueue("sum", &[1, 1]).await;
    let bot = h.register("fleet", "a", &[], 1).await;

    let stale = h
        .orchestrator
        .claim(bot.bot_id, uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(stale, FleetError::SessionExpired(bot.bot_id));

    // Silent past the unhealthy threshold (60 s) and the session ttl.
    h.advance_secs(61);
    let monitor = h.orchestrator.health_monitor();
    monitor.sweep().await.unwrap();
    assert_eq!(
        h.orchestrator.get_bot(bot.bot_id).await.unwrap().health_status,
        HealthStatus::Unhealthy
    );
    let expired = h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap_err();
    assert_eq!(expired, FleetError::SessionExpired(bot.bot_id));

    // Heartbeat renews the same session and restores health.
    h.orchestrator
        .heartbeat(bot.bot_id, bot.session_id)
        .await
        .unwrap();
    assert!(h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap()
        .job()
        .is_some());
}

#[tokio::test]
async fn test_unhealthy_bot_with_live_session_cannot_claim() {
    let mut config = test_harness::test_config();
    config.session.ttl_secs = 600;
    let h = Harness::with_config(config);
    h.enqueue("sum", &[1, 1]).await;
    let bot = h.register("fleet", "a", &[], 1).await;

    h.advance_secs(61);
    h.orchestrator.health_monitor().sweep().await.unwrap();

    let err = h
        .orchestrator
        .claim(bot.bot_id, bot.session_id)
        .await
        .unwrap_err();
    assert_eq!(err, FleetError::BotUnhealthy(bot.bot_id));
}

#[tokio::test]
async fn test_explicit_release_returns_job_and_capacity() {
    let h = Harness::new();
    let job = h.enqueue("multiply", &[6, 7]).await;
    let bot = h.register("fleet", "a", &[], 1).await;
    h.claim_job(&bot).await;

    assert_eq!(
        h.orchestrator.release_job(job.id).await.unwrap(),
        Some(bot.bot_id)
    );
    assert_eq!(h.active_claims(&bot).await, 0);
    assert_eq!(
        h.orchestrator.get_job(job.id).await.unwrap().status,
        JobStatus::Pending
    );

    // Released jobs are claimable again, and the attempt count carries on.
    let again = h.claim_job(&bot).await;
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn test_capability_filter_applies_to_unpinned_bots() {
    let h = Harness::new();
    h.enqueue("sum", &[1, 1]).await;
    let divide = h.enqueue("divide", &[9, 3]).await;

    let bot = h.register("fleet", "a", &["divide"], 1).await;
    assert_eq!(h.claim_job(&bot).await.id, divide.id);
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_operation_and_empty_batch() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .enqueue("modulo", vec![1, 2], None)
        .await
        .unwrap_err();
    assert_eq!(err, FleetError::UnknownOperation("modulo".into()));

    let empty = h
        .orchestrator
        .enqueue_batch(botfleet::orchestrator::EnqueueBatch {
            operation: "sum".into(),
            args: Vec::new(),
            queue: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(empty, FleetError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_oversized_batch_queues_nothing() {
    let mut config = test_harness::test_config();
    config.max_jobs = 4;
    let h = Harness::with_config(config);
    h.enqueue("sum", &[1, 1]).await;

    let batch = |n: i64| botfleet::orchestrator::EnqueueBatch {
        operation: "multiply".into(),
        args: (0..n).map(|i| vec![i, 2]).collect(),
        queue: None,
    };
    let err = h.orchestrator.enqueue_batch(batch(4)).await.unwrap_err();
    assert_eq!(err, FleetError::QueueFull(4));
    assert_eq!(h.orchestrator.stats().await.unwrap().jobs.total(), 1);

    assert_eq!(h.orchestrator.enqueue_batch(batch(3)).await.unwrap().len(), 3);
}
