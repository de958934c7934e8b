// =============================================================================
// Per-trade keyed mutex registry
// =============================================================================
//
// Concurrent follow-ups for the same trade must be serialized: only one
// in-flight action per trade id at a time (see the concurrency model). This
// is an arena keyed by trade id, holding one `tokio::sync::Mutex<()>` per key,
// created lazily and never removed — trade ids are monotonic surrogate keys
// so the arena grows boundedly with the lifetime of the process's trade set.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct TradeLockRegistry {
    locks: SyncMutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl TradeLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, trade_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(trade_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire the lock for `trade_id`, suspending until it is free. The
    /// returned guard releases the lock on drop.
    pub async fn acquire(&self, trade_id: u64) -> OwnedMutexGuard<()> {
        let lock = self.entry(trade_id);
        lock.lock_owned().await
    }

    /// Number of distinct trade ids that have ever been locked. Exposed for
    /// tests only; the registry never shrinks this set.
    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.locks.lock().len()
    }
}
