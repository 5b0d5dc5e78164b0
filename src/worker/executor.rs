use std::sync::Arc;

use uuid::Uuid;

use crate::operations::OperationRegistry;
use crate::scheduler::{Job, JobOutcome};

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub outcome: JobOutcome,
}

/// Runs a claimed job against the bot's local operation registry.
///
/// Validation and execution errors become a `Failure` outcome; they are
/// reported back like any other result rather than aborting the bot.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    operations: Arc<OperationRegistry>,
}

impl JobExecutor {
    pub fn new(operations: Arc<OperationRegistry>) -> Self {
        Self { operations }
    }

    pub fn execute(&self, job: &Job) -> ExecutionResult {
        tracing::info!(job_id = %job.id, operation = %job.operation, args = ?job.args, "Executing job");

        let outcome = match self.operations.execute(&job.operation, &job.args) {
            Ok(result) => {
                tracing::info!(job_id = %job.id, result, "Job succeeded");
                JobOutcome::Success { result }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job failed");
                JobOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };

        ExecutionResult {
            job_id: job.id,
            outcome,
        }
    }
}
