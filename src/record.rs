use std::sync::{Mutex, MutexGuard};

use crate::error::{FleetError, Result};

/// A single mutable row in one of the shared tables.
///
/// Every state transition on a job or bot happens while holding exactly one
/// record guard, so check-and-set on the row is atomic without any lock over
/// the whole table. Guards must be dropped before awaiting.
#[derive(Debug)]
pub struct Record<T> {
    inner: Mutex<T>,
}

impl<T> Record<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.inner
            .lock()
            .map_err(|_| FleetError::StoreUnavailable("record lock poisoned".to_string()))
    }
}

impl<T: Clone> Record<T> {
    pub fn snapshot(&self) -> Result<T> {
        Ok(self.lock()?.clone())
    }
}
