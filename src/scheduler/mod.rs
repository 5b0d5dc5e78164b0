pub mod coordinator;
pub mod job;
pub mod store;

pub use coordinator::{ClaimCoordinator, ClaimOutcome, ReportAck};
pub use job::{Job, JobOutcome, JobStatus, ReleaseReason};
pub use store::{ClaimFilter, JobStore};
