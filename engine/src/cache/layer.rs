use super::{CacheBuilder, CacheEntry, CacheKey, CacheRead, FileCacheStore};
use crate::clock::Clock;
use chrono::Duration;
use sdk::errors::EngineError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Progress of one scheduled build
#[derive(Debug, Clone, PartialEq)]
enum BuildState {
    Queued,
    Done,
    Failed(String),
}

/// Final result of a build, as seen by a waiter
pub type BuildOutcome = Result<(), String>;

/// Waits for a scheduled build of one key
#[derive(Debug)]
pub struct BuildHandle {
    rx: watch::Receiver<BuildState>,
}

impl BuildHandle {
    fn failed(reason: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(BuildState::Failed(reason.into()));
        Self { rx }
    }

    /// Resolve once the build has finished or failed
    pub async fn wait(mut self) -> BuildOutcome {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                BuildState::Done => return Ok(()),
                BuildState::Failed(reason) => return Err(reason),
                BuildState::Queued => {}
            }

            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return match last {
                    BuildState::Done => Ok(()),
                    BuildState::Failed(reason) => Err(reason),
                    BuildState::Queued => Err("build abandoned".to_string()),
                };
            }
        }
    }
}

/// Counters exposed on the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
}

struct Inner {
    store: FileCacheStore,
    builder: Arc<dyn CacheBuilder>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,

    // Lock order: in_flight before entries
    in_flight: Mutex<HashMap<CacheKey, watch::Sender<BuildState>>>,
    queue: mpsc::UnboundedSender<CacheKey>,
    counters: Counters,
}

/// TTL cache backed by [`FileCacheStore`]
///
/// At most one build per key is in flight at any time. Builds run on a
/// fixed pool of workers draining an unbounded queue, so a burst of cold
/// reads never starts more than `workers` upstream queries at once.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<Inner>,
}

impl CacheLayer {
    /// Create the layer, load the persisted entries and start the workers
    ///
    /// Must be called from within a Tokio runtime. Reads never touch the
    /// disk afterwards; the index loaded here plus completed builds is
    /// everything `get` sees.
    pub fn new(
        store: FileCacheStore,
        builder: Arc<dyn CacheBuilder>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        workers: usize,
    ) -> Self {
        let entries: HashMap<CacheKey, CacheEntry> = match store.load_all() {
            Ok(loaded) => loaded.into_iter().map(|e| (e.key.clone(), e)).collect(),
            Err(e) => {
                warn!("Failed to load cache index from {}: {}", store.root().display(), e);
                HashMap::new()
            }
        };
        debug!("Loaded {} cache entries", entries.len());

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            store,
            builder,
            clock,
            ttl,
            entries: RwLock::new(entries),
            in_flight: Mutex::new(HashMap::new()),
            queue: tx,
            counters: Counters::default(),
        });

        spawn_workers(&inner, rx, workers.max(1));
        info!("Cache layer started with {} workers", workers.max(1));

        Self { inner }
    }

    /// Look up `key` without waiting on the builder
    ///
    /// Anything other than a fresh entry schedules a build, unless one is
    /// already running for this key.
    pub fn get(&self, key: &CacheKey) -> CacheRead {
        let now = self.inner.clock.now();

        match self.inner.cached(key) {
            Some(entry) if entry.is_fresh(now, self.inner.ttl) => {
                self.inner.counters.fresh_hits.fetch_add(1, Ordering::Relaxed);
                CacheRead::Fresh(entry)
            }
            Some(entry) => {
                self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                self.inner.schedule(key, false);
                CacheRead::Stale(entry)
            }
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.inner.schedule(key, false);
                CacheRead::Pending
            }
        }
    }

    /// Rebuild `key` regardless of freshness
    ///
    /// Joins the running build if there is one.
    pub fn refresh(&self, key: &CacheKey) -> BuildHandle {
        self.inner
            .schedule(key, true)
            .unwrap_or_else(|| BuildHandle::failed("build was not scheduled"))
    }

    /// Handle on the running build for `key`, if any
    pub fn completion(&self, key: &CacheKey) -> Option<BuildHandle> {
        self.inner
            .lock_in_flight()
            .get(key)
            .map(|tx| BuildHandle { rx: tx.subscribe() })
    }

    pub fn is_building(&self, key: &CacheKey) -> bool {
        self.inner.lock_in_flight().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let in_flight = self.in_flight_count();
        CacheStats {
            entries: self
                .inner
                .entries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            fresh_hits: c.fresh_hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            builds_succeeded: c.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: c.builds_failed.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

impl Inner {
    fn lock_in_flight(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<CacheKey, watch::Sender<BuildState>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Queue a build for `key` unless one is already in flight
    ///
    /// Returns `None` only when `force` is false and a fresh entry appeared
    /// since the caller looked.
    fn schedule(&self, key: &CacheKey, force: bool) -> Option<BuildHandle> {
        let mut in_flight = self.lock_in_flight();

        if let Some(tx) = in_flight.get(key) {
            return Some(BuildHandle { rx: tx.subscribe() });
        }

        if !force {
            let now = self.clock.now();
            if let Some(entry) = self.cached(key) {
                if entry.is_fresh(now, self.ttl) {
                    return None;
                }
            }
        }

        let (tx, rx) = watch::channel(BuildState::Queued);
        if self.queue.send(key.clone()).is_err() {
            warn!("Cache workers are not running, cannot build {}", key);
            return Some(BuildHandle::failed("cache workers are not running"));
        }

        debug!("Scheduled cache build for {}", key);
        in_flight.insert(key.clone(), tx);
        Some(BuildHandle { rx })
    }

    async fn run_build(&self, key: CacheKey) {
        let builder = self.builder.clone();
        let task_key = key.clone();
        let result = match tokio::spawn(async move { builder.build(&task_key).await }).await {
            Ok(result) => result,
            Err(e) => Err(EngineError::CacheBuild {
                key: key.to_string(),
                reason: format!("build task aborted: {}", e),
            }),
        };

        let entry = match result {
            Ok(payload) => {
                let entry = CacheEntry {
                    key: key.clone(),
                    created_at: self.clock.now(),
                    payload,
                };
                let store = self.store.clone();
                let persisted = entry.clone();
                let written = tokio::task::spawn_blocking(move || store.write(&persisted)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to persist cache entry {}: {}", key, e),
                    Err(e) => warn!("Cache write task for {} aborted: {}", key, e),
                }
                Ok(entry)
            }
            Err(e) => Err(e),
        };

        self.complete(&key, entry);
    }

    fn complete(&self, key: &CacheKey, result: Result<CacheEntry, EngineError>) {
        let mut in_flight = self.lock_in_flight();

        let state = match result {
            Ok(entry) => {
                self.entries
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone(), entry);
                self.counters.builds_succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("Cache entry {} built", key);
                BuildState::Done
            }
            Err(e) => {
                let err = match e {
                    e @ EngineError::CacheBuild { .. } => e,
                    other => EngineError::CacheBuild {
                        key: key.to_string(),
                        reason: other.to_string(),
                    },
                };
                self.counters.builds_failed.fetch_add(1, Ordering::Relaxed);
                warn!("{}", err);
                BuildState::Failed(err.to_string())
            }
        };

        if let Some(tx) = in_flight.remove(key) {
            tx.send_replace(state);
        }
    }
}

fn spawn_workers(inner: &Arc<Inner>, rx: mpsc::UnboundedReceiver<CacheKey>, workers: usize) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    for id in 0..workers {
        let rx = rx.clone();
        let weak: Weak<Inner> = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                let next = { rx.lock().await.recv().await };
                let Some(key) = next else { break };
                let Some(inner) = weak.upgrade() else { break };
                inner.run_build(key).await;
            }
            debug!("Cache worker {} stopped", id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl CacheBuilder for Echo {
        async fn build(&self, key: &CacheKey) -> Result<Value, EngineError> {
            Ok(json!({ "country": key.country }))
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_and_persists() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let layer = CacheLayer::new(
            store.clone(),
            Arc::new(Echo),
            Arc::new(SystemClock),
            Duration::hours(24),
            2,
        );
        let key = CacheKey::country_detail("earth", 2024, "Germany");

        layer.refresh(&key).wait().await.unwrap();

        match layer.get(&key) {
            CacheRead::Fresh(entry) => assert_eq!(entry.payload["country"], "Germany"),
            other => panic!("expected fresh entry, got {:?}", other),
        }
        assert!(store.read(&key).unwrap().is_some());
        assert_eq!(layer.stats().builds_succeeded, 1);
    }

    #[tokio::test]
    async fn test_failed_handle_reports_reason() {
        let outcome = BuildHandle::failed("no workers").wait().await;
        assert_eq!(outcome, Err("no workers".to_string()));
    }
}
