use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::constants::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW};

/// Recently seen notification identifiers.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait NotificationStore: Send + Sync {
    /// Atomically claim `id` if it has not been seen inside the window.
    /// Returns `false` for a duplicate.
    fn try_claim(&self, id: &str) -> bool;

    /// Forget `id` so a later delivery of it is processed again.
    fn release(&self, id: &str);

    fn is_seen(&self, id: &str) -> bool;

    /// Drop identifiers older than the window. Returns the number removed.
    fn purge_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory store. Lost on restart, which only means a provider
/// retry after a restart is verified again.
pub struct InMemoryNotificationStore {
    seen: DashMap<String, Instant>,
    capacity: usize,
    window: Duration,
}

impl InMemoryNotificationStore {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            capacity: capacity.max(1),
            window,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Purge expired ids, then evict the oldest one if still full.
    ///
    /// The len() check is not atomic with the insert in `try_claim`, so the
    /// capacity can be overshot by the number of concurrent callers.
    fn make_room(&self) {
        if self.seen.len() < self.capacity {
            return;
        }
        self.purge_expired();
        while self.seen.len() >= self.capacity {
            let oldest = self
                .seen
                .iter()
                .min_by_key(|e| *e.value())
                .map(|e| e.key().clone());
            match oldest {
                Some(id) => {
                    self.seen.remove(&id);
                    tracing::debug!(id = %id, "evicted oldest notification id");
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW)
    }
}

impl NotificationStore for InMemoryNotificationStore {
    fn try_claim(&self, id: &str) -> bool {
        use dashmap::mapref::entry::Entry;

        self.make_room();
        let now = Instant::now();
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) >= self.window {
                    seen.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(v) => {
                v.insert(now);
                true
            }
        }
    }

    fn release(&self, id: &str) {
        self.seen.remove(id);
    }

    fn is_seen(&self, id: &str) -> bool {
        self.seen
            .get(id)
            .map(|at| at.elapsed() < self.window)
            .unwrap_or(false)
    }

    fn purge_expired(&self) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen.retain(|_, at| at.elapsed() < window);
        before.saturating_sub(self.seen.len())
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Periodically purge expired ids in the background.
pub fn spawn_purge_task(
    store: Arc<dyn NotificationStore>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::info!(purged, "purged expired notification ids");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_atomic() {
        let store = InMemoryNotificationStore::default();
        assert!(store.try_claim("ABC"));
        assert!(!store.try_claim("ABC"));
        assert!(store.is_seen("ABC"));
        assert!(!store.is_seen("DEF"));
    }

    #[test]
    fn test_release_allows_reclaim() {
        let store = InMemoryNotificationStore::default();
        assert!(store.try_claim("ABC"));
        store.release("ABC");
        assert!(!store.is_seen("ABC"));
        assert!(store.try_claim("ABC"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = InMemoryNotificationStore::new(3, Duration::from_secs(3600));
        for id in ["a", "b", "c", "d"] {
            assert!(store.try_claim(id));
        }
        assert!(store.len() <= 3);
        assert!(store.is_seen("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry() {
        let store = InMemoryNotificationStore::new(16, Duration::from_secs(60));
        assert!(store.try_claim("ABC"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!store.try_claim("ABC"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.is_seen("ABC"));
        assert!(store.try_claim("ABC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryNotificationStore::new(16, Duration::from_secs(60));
        store.try_claim("old");
        tokio::time::advance(Duration::from_secs(30)).await;
        store.try_claim("new");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.is_seen("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_runs() {
        let store = Arc::new(InMemoryNotificationStore::new(16, Duration::from_secs(10)));
        store.try_claim("a");
        let handle = spawn_purge_task(store.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
