use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard};

/// Scope of an idempotency key: the endpoint, the caller's `bot_key`, and
/// the key it supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub endpoint: &'static str,
    pub bot_key: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(endpoint: &'static str, bot_key: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint,
            bot_key: bot_key.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord<T> {
    pub response: T,
    /// Digest of the request body that produced `response`.
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Cached responses for retried mutating calls, evicted by TTL.
///
/// Callers hold [`IdempotencyStore::lock`] across lookup, side effect and
/// insert so two concurrent retries with the same key cannot both act.
#[derive(Debug)]
pub struct IdempotencyStore<T> {
    ttl: Duration,
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord<T>>>,
}

pub struct IdempotencyGuard<'a, T> {
    ttl: Duration,
    records: MutexGuard<'a, HashMap<IdempotencyKey, IdempotencyRecord<T>>>,
}

impl<T: Clone> IdempotencyStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self) -> IdempotencyGuard<'_, T> {
        IdempotencyGuard {
            ttl: self.ttl,
            records: self.records.lock().await,
        }
    }

    /// Drop records past their TTL. Returns how many were removed.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl<T: Clone> IdempotencyGuard<'_, T> {
    /// A live record for `key`, if any.
    pub fn lookup(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Option<&IdempotencyRecord<T>> {
        self.records.get(key).filter(|record| record.expires_at > now)
    }

    pub fn remember(
        &mut self,
        key: IdempotencyKey,
        response: T,
        fingerprint: String,
        now: DateTime<Utc>,
    ) {
        self.records.insert(
            key,
            IdempotencyRecord {
                response,
                fingerprint,
                expires_at: now + self.ttl,
            },
        );
    }
}
