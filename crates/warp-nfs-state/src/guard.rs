//! Shared/exclusive gate over request processing
//!
//! Ordinary requests run under the shared side. Teardown that must not
//! race in-flight requests (revocation, end-of-grace bookkeeping, the
//! sweep's purge phase) takes the exclusive side. The gate is never held
//! across a blocking callback; snapshots are re-validated instead.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) struct StateGate {
    inner: RwLock<()>,
}

impl StateGate {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(()),
        }
    }

    pub(crate) async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }

    /// Non-blocking shared acquisition; the sweep skips a tick rather than
    /// queueing behind an exclusive holder
    pub(crate) fn try_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.inner.try_read().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_shared_respects_exclusive() {
        let gate = StateGate::new();
        {
            let _w = gate.exclusive().await;
            assert!(gate.try_shared().is_none());
        }
        assert!(gate.try_shared().is_some());
    }
}
