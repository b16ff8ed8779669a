use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Serializes turns for the same phone number inside this process.
///
/// Locks live in a cache with a time-to-idle equal to the context TTL, so
/// numbers that stop writing do not keep a mutex forever. Processes that
/// share a context store can still interleave (last write wins).
#[derive(Clone, Debug)]
pub struct ConversationLocks {
    locks: Cache<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub fn new(idle: Duration) -> Self {
        let locks = Cache::builder()
            .time_to_idle(idle)
            .eviction_listener(|key: Arc<String>, _value: Arc<Mutex<()>>, cause| {
                debug!("Conversation lock dropped: key={}, cause={:?}", key, cause);
            })
            .build();
        Self { locks }
    }

    /// Wait for exclusive access to `phone_number`'s conversation.
    pub async fn acquire(&self, phone_number: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .get_with(phone_number.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        lock.lock_owned().await
    }

    pub async fn forget(&self, phone_number: &str) {
        self.locks.invalidate(phone_number).await;
    }
}
