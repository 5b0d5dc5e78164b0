use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::fleet::bot::Bot;
use crate::record::Record;

#[derive(Debug, Default)]
struct BotTables {
    by_id: HashMap<Uuid, Arc<Record<Bot>>>,
    by_identity: HashMap<(String, String), Uuid>,
}

/// Bot table, keyed by id and by (`bot_key`, `instance_id`).
///
/// Bots are never deleted. Field updates go through the per-bot record lock.
#[derive(Debug, Default)]
pub struct BotRegistry {
    tables: RwLock<BotTables>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `fresh` unless a bot with the same identity exists, in which
    /// case `update` is applied to the existing row. Returns the stored bot.
    pub(crate) async fn upsert(
        &self,
        fresh: Bot,
        update: impl FnOnce(&mut Bot),
    ) -> Result<Bot> {
        let identity = (fresh.bot_key.clone(), fresh.instance_id.clone());
        let mut tables = self.tables.write().await;

        if let Some(id) = tables.by_identity.get(&identity).copied() {
            if let Some(record) = tables.by_id.get(&id) {
                let mut bot = record.lock()?;
                update(&mut bot);
                return Ok(bot.clone());
            }
        }

        let stored = fresh.clone();
        tables.by_identity.insert(identity, fresh.id);
        tables.by_id.insert(fresh.id, Arc::new(Record::new(fresh)));
        Ok(stored)
    }

    pub(crate) async fn record(&self, bot_id: Uuid) -> Result<Arc<Record<Bot>>> {
        self.tables
            .read()
            .await
            .by_id
            .get(&bot_id)
            .cloned()
            .ok_or(FleetError::BotNotFound(bot_id))
    }

    /// Apply `f` to the bot under its record lock.
    pub async fn update<T>(&self, bot_id: Uuid, f: impl FnOnce(&mut Bot) -> Result<T>) -> Result<T> {
        let record = self.record(bot_id).await?;
        let mut bot = record.lock()?;
        f(&mut bot)
    }

    pub async fn get(&self, bot_id: Uuid) -> Result<Bot> {
        self.record(bot_id).await?.snapshot()
    }

    pub async fn find(&self, bot_key: &str, instance_id: &str) -> Result<Option<Bot>> {
        let tables = self.tables.read().await;
        let key = (bot_key.to_string(), instance_id.to_string());
        match tables.by_identity.get(&key).and_then(|id| tables.by_id.get(id)) {
            Some(record) => Ok(Some(record.snapshot()?)),
            None => Ok(None),
        }
    }

    /// Give back `count` units of claim capacity. Unknown bots are ignored.
    pub async fn release_claims(&self, bot_id: Uuid, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        match self.record(bot_id).await {
            Ok(record) => {
                record.lock()?.release_claims(count);
                Ok(())
            }
            Err(FleetError::BotNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.tables.read().await.by_id.keys().copied().collect()
    }

    /// All bots ordered by registration time.
    pub async fn list(&self) -> Result<Vec<Bot>> {
        let tables = self.tables.read().await;
        let mut bots = tables
            .by_id
            .values()
            .map(|record| record.snapshot())
            .collect::<Result<Vec<_>>>()?;
        bots.sort_by_key(|b| b.registered_at);
        Ok(bots)
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.by_id.is_empty()
    }
}
