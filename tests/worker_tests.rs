
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use botfleet::config::{BackoffPolicy, OrchestratorConfig};
use botfleet::error::{FleetError, Result};
use botfleet::fleet::sessions::HeartbeatAck;
use botfleet::fleet::{RegistrationRequest, RegistrationResponse};
use botfleet::operations::OperationRegistry;
use botfleet::scheduler::{ClaimOutcome, JobOutcome, JobStatus, ReportAck};
use botfleet::worker::{
    BotTransport, BotWorker, CircuitBreaker, LocalTransport, ResilientClient, RetryPolicy,
};

use test_harness::{test_config, Harness};

fn fast_config() -> OrchestratorConfig {
    let mut config = test_config();
    config.policy.backoff = BackoffPolicy {
        min_ms: 5,
        max_ms: 20,
        jitter: false,
    };
    config
}

fn operations() -> Arc<OperationRegistry> {
    Arc::new(OperationRegistry::with_defaults())
}

async fn wait_for_finished(h: &Harness, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let counts = h.orchestrator.stats().await.unwrap().jobs;
            if counts.succeeded + counts.failed >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs finished in time");
}

#[tokio::test]
async fn test_local_bot_runs_jobs_to_completion() {
    let h = Harness::with_config(fast_config());
    let ok = h.enqueue("multiply", &[6, 7]).await;
    let bad = h.enqueue("divide", &[10, 0]).await;
    let also_ok = h.enqueue("divide", &[10, 3]).await;

    let worker = BotWorker::new(
        LocalTransport::new(h.orchestrator.clone()),
        RegistrationRequest::new("calc", "w-1").with_capabilities(&[], 1),
        operations(),
    )
    .with_job_limit(3);

    let stats = tokio::time::timeout(Duration::from_secs(10), worker.run(CancellationToken::new()))
        .await
        .expect("worker finished")
        .unwrap();
    assert_eq!(stats.registrations, 1);
    assert_eq!(stats.jobs_succeeded, 2);
    assert_eq!(stats.jobs_failed, 1);

    let ok = h.orchestrator.get_job(ok.id).await.unwrap();
    assert_eq!(ok.status, JobStatus::Succeeded);
    assert_eq!(ok.result, Some(42));

    let bad = h.orchestrator.get_job(bad.id).await.unwrap();
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.error.unwrap().contains("division by zero"));

    let also_ok = h.orchestrator.get_job(also_ok.id).await.unwrap();
    assert_eq!(also_ok.result, Some(3));

    let bots = h.orchestrator.list_bots().await.unwrap();
    assert_eq!(bots[0].active_claims, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bots_share_queue_until_shutdown() {
    let h = Harness::with_config(fast_config());
    for i in 0..40 {
        h.enqueue("sum", &[i, i]).await;
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for i in 0..3 {
        let worker = BotWorker::new(
            LocalTransport::new(h.orchestrator.clone()),
            RegistrationRequest::new("calc", format!("w-{}", i)).with_capabilities(&["sum"], 2),
            operations(),
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    wait_for_finished(&h, 40).await;
    shutdown.cancel();

    let mut handled = 0;
    for handle in handles {
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.conflicts, 0);
        handled += stats.jobs_succeeded;
    }
    assert_eq!(handled, 40);
    assert_eq!(h.orchestrator.stats().await.unwrap().jobs.succeeded, 40);
}

#[tokio::test]
async fn test_superseded_bot_reregisters_and_keeps_working() {
    let h = Harness::with_config(fast_config());
    let shutdown = CancellationToken::new();
    let worker = BotWorker::new(
        LocalTransport::new(h.orchestrator.clone()),
        RegistrationRequest::new("calc", "w-1").with_capabilities(&[], 1),
        operations(),
    )
    .with_heartbeat_interval(Duration::from_millis(10));
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.orchestrator.bots().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker registered");

    // Someone else registers the same identity: the worker's session is gone.
    h.orchestrator
        .register(RegistrationRequest::new("calc", "w-1"))
        .await
        .unwrap();

    h.enqueue("subtract", &[10, 4]).await;
    wait_for_finished(&h, 1).await;
    shutdown.cancel();

    let stats = handle.await.unwrap().unwrap();
    assert!(stats.registrations >= 2, "stats: {:?}", stats);
    assert_eq!(stats.jobs_succeeded, 1);
}

#[tokio::test]
async fn test_rejected_registration_ends_worker() {
    let h = Harness::new();
    let worker = BotWorker::new(
        LocalTransport::new(h.orchestrator.clone()),
        RegistrationRequest::new("calc", "w-1").with_capabilities(&["modulo"], 1),
        operations(),
    );
    let err = worker.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err, FleetError::UnknownOperation("modulo".into()));
}

/// Fails the first `failures` claims with a transport error.
struct FlakyTransport {
    inner: LocalTransport,
    failures: AtomicU32,
}

#[async_trait]
impl BotTransport for FlakyTransport {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        self.inner.register(request).await
    }

    async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck> {
        self.inner.heartbeat(bot_id, session_id).await
    }

    async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FleetError::Transport("connection reset".into()));
        }
        self.inner.claim(bot_id, session_id).await
    }

    async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<ReportAck> {
        self.inner.report(bot_id, session_id, job_id, outcome).await
    }
}

#[tokio::test]
async fn test_worker_rides_out_transport_failures() {
    let h = Harness::with_config(fast_config());
    let job = h.enqueue("sum", &[20, 22]).await;

    let client = ResilientClient::with_policy(
        FlakyTransport {
            inner: LocalTransport::new(h.orchestrator.clone()),
            failures: AtomicU32::new(6),
        },
        RetryPolicy {
            backoff: BackoffPolicy {
                min_ms: 1,
                max_ms: 5,
                jitter: true,
            },
            max_attempts: 3,
        },
        CircuitBreaker::new(10, Duration::from_millis(20)),
    );
    let worker = BotWorker::with_client(
        Arc::new(client),
        RegistrationRequest::new("calc", "w-1").with_capabilities(&[], 1),
        operations(),
    )
    .with_job_limit(1);

    let stats = tokio::time::timeout(Duration::from_secs(10), worker.run(CancellationToken::new()))
        .await
        .expect("worker finished")
        .unwrap();
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(
        h.orchestrator.get_job(job.id).await.unwrap().result,
        Some(42)
    );
}
