use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation already registered: {0}")]
    DuplicateOperation(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Bot not found: {0}")]
    BotNotFound(Uuid),

    #[error("Claim conflict on job {job_id}: {reason}")]
    ClaimConflict { job_id: Uuid, reason: String },

    #[error("Session expired for bot {0}, re-register required")]
    SessionExpired(Uuid),

    #[error("Bot {0} is unhealthy, heartbeat or re-register before claiming")]
    BotUnhealthy(Uuid),

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FleetError {
    pub fn conflict(job_id: Uuid, reason: impl Into<String>) -> Self {
        FleetError::ClaimConflict {
            job_id,
            reason: reason.into(),
        }
    }

    /// Transient infrastructure failures. Everything else is a definitive
    /// answer that repeating the same call will not change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::StoreUnavailable(_) | FleetError::Transport(_)
        )
    }

    /// Stable machine-readable tag, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "validation_error",
            FleetError::Execution(_) => "execution_error",
            FleetError::UnknownOperation(_) => "unknown_operation",
            FleetError::DuplicateOperation(_) => "duplicate_operation",
            FleetError::JobNotFound(_) => "job_not_found",
            FleetError::BotNotFound(_) => "bot_not_found",
            FleetError::ClaimConflict { .. } => "claim_conflict",
            FleetError::SessionExpired(_) => "session_expired",
            FleetError::BotUnhealthy(_) => "bot_unhealthy",
            FleetError::QueueFull(_) => "queue_full",
            FleetError::InvalidRequest(_) => "invalid_request",
            FleetError::StoreUnavailable(_) => "store_unavailable",
            FleetError::CircuitOpen(_) => "circuit_open",
            FleetError::Transport(_) => "transport_error",
            FleetError::Config(_) => "config_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
