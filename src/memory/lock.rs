//! The store gate: shared entry for store-transactions, exclusive lock for
//! generation transitions, file flips and the standby sync snapshot.

use crate::error::{Error, Result};
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exclusive hold of the store. Owned, so a state machine can keep it across
/// several steps.
pub type StoreLock = ArcRwLockWriteGuard<RawRwLock, ()>;

#[derive(Debug, Clone, Default)]
pub struct StoreGate {
    lock: Arc<RwLock<()>>,
}

impl StoreGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared entry held while a store-transaction mutates memory.
    pub fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Non-blocking attempt at the exclusive lock.
    pub fn try_lock(&self) -> Option<StoreLock> {
        self.lock.try_write_arc()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<StoreLock> {
        self.lock.try_write_arc_for(timeout)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked_exclusive()
    }

    /// Bounded retry: `attempts` tries of `timeout` each, then `Timeout`.
    pub fn lock_with_retry(&self, attempts: u32, timeout: Duration, who: &str) -> Result<StoreLock> {
        for attempt in 1..=attempts {
            if let Some(guard) = self.try_lock_for(timeout) {
                debug!(who, attempt, "store locked");
                return Ok(guard);
            }
            warn!(who, attempt, attempts, "store lock attempt timed out");
        }
        Err(Error::Timeout)
    }
}
