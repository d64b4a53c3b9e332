use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Cached<T> {
    value: Option<Arc<T>>,
    dirty: bool,
    /// Bumped by every invalidation; a refresh that started before the bump
    /// leaves the entry dirty.
    epoch: u64,
    last_refresh: Option<Instant>,
}

/// A cached value refreshed at most once per `reload_interval`, with at most
/// one refresh in flight. Concurrent readers that miss wait for that refresh
/// instead of starting their own.
#[derive(Debug)]
pub struct ClusterMetadataCache<T> {
    reload_interval: Duration,
    state: Mutex<Cached<T>>,
    refresh: tokio::sync::Mutex<()>,
}

impl<T> ClusterMetadataCache<T> {
    pub fn new(reload_interval: Duration) -> Self {
        Self {
            reload_interval,
            state: Mutex::new(Cached {
                value: None,
                dirty: true,
                epoch: 0,
                last_refresh: None,
            }),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Forces the next read to refresh.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.dirty = true;
        state.epoch += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    fn fresh(&self) -> Option<Arc<T>> {
        let state = self.state.lock();
        if state.dirty {
            return None;
        }
        let within = state
            .last_refresh
            .is_some_and(|at| at.elapsed() < self.reload_interval);
        if !within {
            return None;
        }
        state.value.clone()
    }

    /// Returns the cached value, calling `load` when it is missing, dirty or
    /// older than the reload interval.
    pub async fn get<E, F, Fut>(&self, load: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }
        let _refresh = self.refresh.lock().await;
        if let Some(value) = self.fresh() {
            return Ok(value);
        }
        let epoch = self.state.lock().epoch;
        let value = Arc::new(load().await?);
        let mut state = self.state.lock();
        state.value = Some(Arc::clone(&value));
        state.last_refresh = Some(Instant::now());
        state.dirty = state.epoch != epoch;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_share_one_refresh() {
        let cache = Arc::new(ClusterMetadataCache::<usize>::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            tasks.push(tokio::spawn(async move {
                cache
                    .get(|| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>(loads.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await
                    .map(|value| *value)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(1));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_reload() {
        let cache = ClusterMetadataCache::<u32>::new(Duration::from_secs(60));
        assert_eq!(*cache.get(|| async { Ok::<_, ()>(1) }).await.unwrap(), 1);
        assert_eq!(*cache.get(|| async { Ok::<_, ()>(2) }).await.unwrap(), 1);
        cache.invalidate();
        assert!(cache.is_dirty());
        assert_eq!(*cache.get(|| async { Ok::<_, ()>(3) }).await.unwrap(), 3);
        assert!(!cache.is_dirty());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_entry_dirty() {
        let cache = ClusterMetadataCache::<u32>::new(Duration::ZERO);
        assert_eq!(cache.get(|| async { Err::<u32, _>("down") }).await, Err("down"));
        assert!(cache.is_dirty());
        assert_eq!(*cache.get(|| async { Ok::<_, &str>(4) }).await.unwrap(), 4);
    }
}
