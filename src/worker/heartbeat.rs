use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::FleetError;
use crate::worker::resilience::{BotTransport, ResilientClient};

/// What the heartbeat loop tells the worker loop.
#[derive(Debug)]
pub enum HeartbeatEvent {
    /// The session was superseded or is unknown; re-register.
    SessionExpired,
    /// A heartbeat failed after retries. The session may still be alive.
    Failed(FleetError),
}

/// Heartbeat sender that periodically renews the bot's session
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatLoop {
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_secs(interval_secs: u64) -> Self {
        Self::new(Duration::from_secs(interval_secs.max(1)))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Renew `session_id` every interval until shutdown, the session is
    /// rejected, or the receiver is dropped.
    pub async fn run<T: BotTransport>(
        self,
        client: Arc<ResilientClient<T>>,
        bot_id: Uuid,
        session_id: Uuid,
        tx: mpsc::Sender<HeartbeatEvent>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Registration already counts as the first beat.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let event = match client.heartbeat(bot_id, session_id).await {
                Ok(ack) => {
                    tracing::trace!(bot_id = %bot_id, health = %ack.health_status, "Heartbeat acknowledged");
                    continue;
                }
                Err(FleetError::SessionExpired(_)) | Err(FleetError::BotNotFound(_)) => {
                    HeartbeatEvent::SessionExpired
                }
                Err(e) => HeartbeatEvent::Failed(e),
            };

            let stop = matches!(event, HeartbeatEvent::SessionExpired);
            if tx.send(event).await.is_err() || stop {
                break;
            }
        }
    }
}
