//! Optional process-wide orchestrator accessor.
//!
//! Dependency injection — constructing one [`Orchestrator`] at process
//! start and passing `Arc<Orchestrator>` down — is the primary wiring.
//! Embedders that genuinely need a global use this accessor instead of a
//! bare mutable static: the instance is constructed once under
//! double-checked locking.

use std::sync::{Arc, RwLock};

use crate::orchestrator::Orchestrator;

static ORCHESTRATOR: RwLock<Option<Arc<Orchestrator>>> = RwLock::new(None);

/// Install a process-global orchestrator. Replaces any previous one.
pub fn init_global(orchestrator: Arc<Orchestrator>) {
    let mut guard = ORCHESTRATOR.write().expect("orchestrator lock poisoned");
    *guard = Some(orchestrator);
}

/// The installed global orchestrator, if any.
pub fn global() -> Option<Arc<Orchestrator>> {
    ORCHESTRATOR
        .read()
        .expect("orchestrator lock poisoned")
        .clone()
}

/// Get the global orchestrator, constructing it on first use.
///
/// `construct` runs at most once per process (double-checked: the fast
/// path is a shared read; the constructor runs under the write lock after
/// a re-check).
pub fn global_or_init<F>(construct: F) -> Arc<Orchestrator>
where
    F: FnOnce() -> Arc<Orchestrator>,
{
    // Fast path: read lock
    {
        let guard = ORCHESTRATOR.read().expect("orchestrator lock poisoned");
        if let Some(ref orchestrator) = *guard {
            return Arc::clone(orchestrator);
        }
    }

    // Slow path: first access, take write lock
    let mut guard = ORCHESTRATOR.write().expect("orchestrator lock poisoned");
    // Double-check after acquiring write lock (another thread may have initialized)
    if let Some(ref orchestrator) = *guard {
        return Arc::clone(orchestrator);
    }

    let orchestrator = construct();
    *guard = Some(Arc::clone(&orchestrator));
    orchestrator
}

/// Clear the global (test-only).
#[cfg(test)]
pub(crate) fn reset_global() {
    let mut guard = ORCHESTRATOR.write().expect("orchestrator lock poisoned");
    *guard = None;
}
