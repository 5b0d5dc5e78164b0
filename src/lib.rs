pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod node;
pub mod operations;
pub mod orchestrator;
pub mod record;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{FleetError, Result};
pub use orchestrator::Orchestrator;
