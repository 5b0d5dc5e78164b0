use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::run_api;
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::fleet::RegistrationRequest;
use crate::operations::OperationRegistry;
use crate::orchestrator::Orchestrator;
use crate::worker::{BotWorker, LocalTransport};

const LOCAL_BOT_KEY: &str = "local";

/// One orchestrator process: the shared tables plus the tasks that serve them.
pub struct Node {
    pub orchestrator: Orchestrator,
    local_bots: usize,
}

impl Node {
    pub fn new(config: OrchestratorConfig, operations: OperationRegistry) -> Result<Self> {
        Ok(Self {
            orchestrator: Orchestrator::new(config, operations)?,
            local_bots: 0,
        })
    }

    /// Also run `count` bots inside this process over [`LocalTransport`].
    pub fn with_local_bots(mut self, count: usize) -> Self {
        self.local_bots = count;
        self
    }

    /// Run the node until `shutdown` fires.
    ///
    /// Starts, in order:
    /// 1. the health monitor (lease expiry, health demotion, purge)
    /// 2. any in-process bots
    /// 3. the HTTP API server, which blocks until shutdown
    ///
    /// Background tasks are cancelled through the same token and awaited
    /// before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        let monitor = self.orchestrator.health_monitor();
        let monitor_token = shutdown.clone();
        tasks.spawn(async move {
            monitor.run(monitor_token).await;
        });

        let operations = Arc::clone(self.orchestrator.operations());
        for i in 0..self.local_bots {
            let request = RegistrationRequest::new(LOCAL_BOT_KEY, format!("local-{}", i))
                .with_capabilities(&[], 1);
            let worker = BotWorker::new(
                LocalTransport::new(self.orchestrator.clone()),
                request,
                operations.clone(),
            );
            let token = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = worker.run(token).await {
                    tracing::error!(error = %e, "Local bot exited");
                }
            });
        }
        if self.local_bots > 0 {
            tracing::info!(count = self.local_bots, "Local bots started");
        }

        let addr = self.orchestrator.config().listen_addr;
        let served = run_api(addr, self.orchestrator.clone(), shutdown.clone()).await;

        // A failed bind must still stop the background tasks.
        shutdown.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background task panicked");
            }
        }

        served.map_err(|e| FleetError::Transport(format!("API server on {}: {}", addr, e)))
    }
}
