//! Bot identity, sessions and health.
//!
//! - [`registry::BotRegistry`]: the bot table
//! - [`sessions::SessionManager`]: registration, heartbeat, admin pinning
//! - [`idempotency::IdempotencyStore`]: replay cache for retried registrations
//! - [`reaper::HealthMonitor`]: demotes silent bots and releases their claims
//!
//! # Health state machine
//!
//! ```text
//! healthy --(missed beats)--> degraded --(sustained)--> unhealthy
//!    ^                                                      |
//!    +----------------- heartbeat / re-register ------------+
//! ```

pub mod bot;
pub mod idempotency;
pub mod reaper;
pub mod registry;
pub mod sessions;

pub use bot::{AgentInfo, Bot, Capabilities, HealthStatus};
pub use reaper::{HealthMonitor, SweepReport};
pub use registry::BotRegistry;
pub use sessions::{RegistrationRequest, RegistrationResponse, SessionManager};
