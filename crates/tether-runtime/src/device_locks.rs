//! Per-device exclusive locks, created lazily on first use.
//!
//! Each device key maps to a one-permit semaphore. Holding the permit IS
//! holding the device: the permit is parked in a holders table so acquire
//! and release can happen in separate calls (and separate tasks), and so
//! release is idempotent — releasing an unheld lock is a no-op.
//!
//! Contention is never an error here. Acquisition reports success as a
//! bool; callers translate failure into their own busy error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Registry handing out exactly one exclusive lock per device key.
pub struct DeviceLockRegistry {
    /// Lock table. The fast path is a lock-free read; creation goes
    /// through the shard entry lock with a re-check.
    locks: DashMap<String, Arc<Semaphore>>,
    /// Permits currently held, keyed by device.
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl DeviceLockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the lock for a device key. Idempotent.
    fn get_or_create(&self, key: &str) -> Arc<Semaphore> {
        // Fast path: lock already exists
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(&lock);
        }
        // Slow path: create under the shard lock, re-checking first
        Arc::clone(
            &self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Try to acquire exclusive access to a device.
    ///
    /// - `None` blocks until the lock is free.
    /// - `Some(Duration::ZERO)` is a non-blocking probe.
    /// - `Some(d)` bounds the wait by `d`.
    ///
    /// Returns `false` on contention/timeout; never errors.
    pub async fn try_acquire(&self, key: &str, timeout: Option<Duration>) -> bool {
        let lock = self.get_or_create(key);

        let permit = match timeout {
            Some(d) if d.is_zero() => lock.try_acquire_owned().ok(),
            Some(d) => match tokio::time::timeout(d, lock.acquire_owned()).await {
                Ok(acquired) => acquired.ok(),
                Err(_elapsed) => None,
            },
            None => lock.acquire_owned().await.ok(),
        };

        match permit {
            Some(permit) => {
                let _ = self.held.lock().insert(key.to_string(), permit);
                debug!(device_key = key, "device lock acquired");
                true
            }
            None => false,
        }
    }

    /// Release a device lock. Idempotent: releasing an unheld lock is a
    /// no-op. Returns whether a permit was actually released.
    pub fn release(&self, key: &str) -> bool {
        let released = self.held.lock().remove(key).is_some();
        if released {
            debug!(device_key = key, "device lock released");
        }
        released
    }

    /// Whether the device lock is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains_key(key)
    }

    /// Number of device locks currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

impl Default for DeviceLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
