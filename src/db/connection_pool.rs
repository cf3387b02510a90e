//! Connection cache shared by all requests.
//!
//! One backend handle is kept per `"{type}:{url}"` key and reused by every
//! request carrying the same configuration. Handles idle longer than the TTL
//! are closed by a background sweep.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per key**: Single-flight creation; concurrent first requests
//!   for one key open exactly one handle. A failed creation leaves the cell
//!   empty and is removed, so the next request retries.
//! - **`AtomicUsize` for active tracking**: Lock-free lease count protects
//!   handles from being swept while a query runs on them.
//! - **[`PooledHandle`] lease**: The count is released synchronously in
//!   `Drop`, including on panic or cancellation of the request future.
//! - **`std::sync::Mutex` for the sweep handle**: Synchronous storage so the
//!   task can be aborted without an await.
//!
//! # Concurrency Safety
//!
//! - All locks are released before async operations (connect, close)
//! - The sweep collects candidates under a read lock, then re-checks each one
//!   under a brief write lock before removing it
//! - A lease counts only once its cell is seen in the map after the count
//!   was raised. A cell removed in between (sweep, eviction, `close_all`) is
//!   released and the request retries with a fresh cell.

use crate::db::backend::{Backend, Connector};
use crate::error::{DbError, DbResult};
use crate::models::{BackendConfig, mask_cache_key};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of backend handles for the dispatcher.
pub trait Pool: Send + Sync + 'static {
    type Handle: Backend;

    /// Return the cached handle for `config`, creating it on first use.
    fn get(
        &self,
        config: &BackendConfig,
    ) -> impl Future<Output = DbResult<PooledHandle<Self::Handle>>> + Send;

    /// Close idle entries past the TTL; returns how many were closed.
    fn sweep(&self) -> impl Future<Output = usize> + Send;

    /// Number of cached handles.
    fn size(&self) -> impl Future<Output = usize> + Send;

    /// Per-entry details for the health endpoint. Keys are masked.
    fn summary(&self) -> impl Future<Output = Vec<EntrySummary>> + Send;

    /// Close every handle. Later `get` calls open new ones.
    fn close_all(&self) -> impl Future<Output = ()> + Send;
}

/// Cache settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Idle time after which an unused handle is closed.
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// 0 = unbounded
    pub max_entries: usize,
}

impl PoolSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            ttl: config.pool_ttl_duration(),
            sweep_interval: config.sweep_interval_duration(),
            max_entries: config.pool_max_entries,
        }
    }
}

/// A cached handle with its bookkeeping.
pub struct PoolEntry<H> {
    pub handle: H,
    key: String,
    /// Uses std::sync::RwLock (not tokio) to avoid holding locks across await points.
    last_accessed: std::sync::RwLock<Instant>,
    pub created_at: Instant,
    /// Count of live leases. The sweep skips entries with active_count > 0.
    active_count: AtomicUsize,
}

impl<H> PoolEntry<H> {
    fn new(key: String, handle: H) -> Self {
        let now = Instant::now();
        Self {
            handle,
            key,
            last_accessed: std::sync::RwLock::new(now),
            created_at: now,
            active_count: AtomicUsize::new(0),
        }
    }

    pub fn increment_active(&self) {
        self.active_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0 to prevent underflow from extra release calls.
    pub fn decrement_active(&self) {
        let result = self
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            warn!(
                key = %mask_cache_key(&self.key),
                "Active count underflow detected - extra release call"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Update last accessed time. Synchronous - does not hold locks across await.
    pub fn touch(&self) {
        if let Ok(mut last_accessed) = self.last_accessed.write() {
            *last_accessed = Instant::now();
        }
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.active_count() == 0 && now.saturating_duration_since(self.last_accessed()) > ttl
    }
}

impl<H> std::fmt::Debug for PoolEntry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("key", &mask_cache_key(&self.key))
            .field("created_at", &self.created_at)
            .field("active_count", &self.active_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// A leased handle. Dropping it releases the lease and refreshes the
/// entry's last-used time.
pub struct PooledHandle<H> {
    handle: H,
    lease: Option<Arc<OnceCell<PoolEntry<H>>>>,
}

impl<H> PooledHandle<H> {
    /// A handle not tracked by any cache.
    pub fn detached(handle: H) -> Self {
        Self {
            handle,
            lease: None,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H> std::fmt::Debug for PooledHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("leased", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

impl<H> std::ops::Deref for PooledHandle<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> Drop for PooledHandle<H> {
    fn drop(&mut self) {
        if let Some(cell) = self.lease.take() {
            if let Some(entry) = cell.get() {
                entry.touch();
                entry.decrement_active();
            }
        }
    }
}

/// One cached entry as shown by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    /// Masked cache key
    pub key: String,
    pub backend: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub active: usize,
}

type Cell<H> = Arc<OnceCell<PoolEntry<H>>>;

/// Keyed, single-flight connection cache with idle expiry.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    /// Per-key lazy handles. OnceCell ensures single-flight creation.
    entries: TokioRwLock<HashMap<String, Cell<C::Handle>>>,
    /// Sweep task handle. Uses std::sync::Mutex for synchronous storage.
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a cache and spawn its sweep task.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn new(connector: C, settings: PoolSettings) -> Arc<Self> {
        let pool = Arc::new(Self {
            connector,
            settings,
            entries: TokioRwLock::new(HashMap::new()),
            sweep_handle: std::sync::Mutex::new(None),
        });

        let weak_pool = Arc::downgrade(&pool);
        let interval = pool.settings.sweep_interval.max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            Self::sweep_task(weak_pool, interval).await;
        });

        if let Ok(mut guard) = pool.sweep_handle.lock() {
            *guard = Some(handle);
        }

        pool
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    async fn acquire(&self, config: &BackendConfig) -> DbResult<PooledHandle<C::Handle>> {
        let key = config
            .cache_key()
            .ok_or_else(|| DbError::validation("dbConfig.type and dbConfig.url are required"))?;

        loop {
            let (cell, evicted) = self.cell_for(&key).await?;
            if let Some(evicted) = evicted {
                close_cell(&evicted, "Closing least recently used connection").await;
            }

            let result = cell
                .get_or_try_init(|| async {
                    info!(key = %mask_cache_key(&key), "Creating new backend connection");
                    let handle = self.connector.connect(config).await?;
                    Ok::<_, DbError>(PoolEntry::new(key.clone(), handle))
                })
                .await;

            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    self.forget_failed(&key, &cell).await;
                    return Err(err);
                }
            };

            entry.touch();
            entry.increment_active();
            let lease = PooledHandle {
                handle: entry.handle.clone(),
                lease: Some(Arc::clone(&cell)),
            };

            // Removal happens under the write lock and skips leased entries,
            // so a cell still present here stays open for this lease
            if self.is_current(&key, &cell).await {
                debug!(
                    key = %mask_cache_key(&key),
                    active = entry.active_count(),
                    "Returning cached connection"
                );
                return Ok(lease);
            }

            debug!(key = %mask_cache_key(&key), "Connection removed while leasing, retrying");
            drop(lease);
        }
    }

    async fn is_current(&self, key: &str, cell: &Cell<C::Handle>) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    /// Find or insert the cell for `key`. When the cache is full, the least
    /// recently used idle entry is removed and returned for closing.
    async fn cell_for(&self, key: &str) -> DbResult<(Cell<C::Handle>, Option<Cell<C::Handle>>)> {
        {
            let entries = self.entries.read().await;
            if let Some(cell) = entries.get(key) {
                return Ok((Arc::clone(cell), None));
            }
        }

        let mut entries = self.entries.write().await;
        // Double-check after acquiring write lock
        if let Some(cell) = entries.get(key) {
            return Ok((Arc::clone(cell), None));
        }

        let mut evicted = None;
        if self.settings.max_entries > 0 && entries.len() >= self.settings.max_entries {
            let victim = entries
                .iter()
                .filter_map(|(k, cell)| {
                    cell.get()
                        .filter(|entry| entry.active_count() == 0)
                        .map(|entry| (k.clone(), entry.last_accessed()))
                })
                .min_by_key(|(_, last_accessed)| *last_accessed)
                .map(|(k, _)| k);

            match victim {
                Some(victim) => evicted = entries.remove(&victim),
                None => {
                    return Err(DbError::connection(
                        format!(
                            "Connection cache is full ({} entries in use)",
                            self.settings.max_entries
                        ),
                        "Retry once running queries finish, or raise the cache limit",
                    ));
                }
            }
        }

        let cell = Arc::new(OnceCell::new());
        entries.insert(key.to_string(), Arc::clone(&cell));
        Ok((cell, evicted))
    }

    /// Drop a cell whose creation failed so the key does not linger.
    async fn forget_failed(&self, key: &str, cell: &Cell<C::Handle>) {
        let mut entries = self.entries.write().await;
        let same_cell = entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.get().is_none());
        if same_cell {
            entries.remove(key);
        }
    }

    /// Close handles idle longer than the TTL. Returns how many were closed.
    ///
    /// Only removes entries that are:
    /// 1. Initialized (OnceCell has a value)
    /// 2. Not actively in use (active_count == 0)
    /// 3. Idle longer than the TTL
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.settings.ttl;

        // Phase 1: Collect candidates with read lock
        let now = Instant::now();
        let candidates: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, cell)| cell.get().is_some_and(|entry| entry.is_expired(now, ttl)))
                .map(|(key, _)| key.clone())
                .collect()
        }; // Read lock released here

        // Phase 2 & 3: Remove with brief write locks, close outside locks
        let mut closed = 0;
        for key in candidates {
            let removed = {
                let mut entries = self.entries.write().await;

                // Re-check after acquiring write lock (TOCTOU protection)
                let still_expired = entries
                    .get(&key)
                    .and_then(|cell| cell.get())
                    .is_some_and(|entry| entry.is_expired(Instant::now(), ttl));
                if !still_expired {
                    debug!(key = %mask_cache_key(&key), "Connection used during sweep, skipping");
                    continue;
                }
                entries.remove(&key)
            }; // Write lock released here

            if let Some(cell) = removed {
                close_cell(&cell, "Closing idle connection").await;
                closed += 1;
            }
        }
        closed
    }

    /// Background task running [`sweep_expired`](Self::sweep_expired) every interval.
    async fn sweep_task(weak_pool: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                info!("Connection cache dropped, sweep task exiting");
                return;
            };

            let closed = pool.sweep_expired().await;
            if closed > 0 {
                info!(closed, "Swept idle connections");
            }

            // Drop strong reference before sleeping to allow deallocation
            drop(pool);
        }
    }

    async fn entry_count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|cell| cell.get().is_some()).count()
    }

    async fn entry_summaries(&self) -> Vec<EntrySummary> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut summaries: Vec<EntrySummary> = entries
            .values()
            .filter_map(|cell| cell.get())
            .map(|entry| EntrySummary {
                key: mask_cache_key(&entry.key),
                backend: entry.handle.backend_type().to_string(),
                age_secs: now.saturating_duration_since(entry.created_at).as_secs(),
                idle_secs: now.saturating_duration_since(entry.last_accessed()).as_secs(),
                active: entry.active_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    async fn close_entries(&self) {
        // Cancel sweep task using synchronous mutex
        if let Ok(mut guard) = self.sweep_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        // Drain under lock, close outside lock
        let drained: Vec<_> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, cell)| cell).collect()
        };

        for cell in drained {
            close_cell(&cell, "Closing connection").await;
        }
    }
}

async fn close_cell<H: Backend>(cell: &Cell<H>, reason: &str) {
    if let Some(entry) = cell.get() {
        info!(key = %mask_cache_key(&entry.key), "{}", reason);
        entry.handle.close().await;
    }
}

impl<C: Connector> Pool for ConnectionPool<C> {
    type Handle = C::Handle;

    fn get(
        &self,
        config: &BackendConfig,
    ) -> impl Future<Output = DbResult<PooledHandle<C::Handle>>> + Send {
        self.acquire(config)
    }

    fn sweep(&self) -> impl Future<Output = usize> + Send {
        self.sweep_expired()
    }

    fn size(&self) -> impl Future<Output = usize> + Send {
        self.entry_count()
    }

    fn summary(&self) -> impl Future<Output = Vec<EntrySummary>> + Send {
        self.entry_summaries()
    }

    fn close_all(&self) -> impl Future<Output = ()> + Send {
        self.close_entries()
    }
}

impl<P: Pool> Pool for Arc<P> {
    type Handle = P::Handle;

    fn get(
        &self,
        config: &BackendConfig,
    ) -> impl Future<Output = DbResult<PooledHandle<P::Handle>>> + Send {
        (**self).get(config)
    }

    fn sweep(&self) -> impl Future<Output = usize> + Send {
        (**self).sweep()
    }

    fn size(&self) -> impl Future<Output = usize> + Send {
        (**self).size()
    }

    fn summary(&self) -> impl Future<Output = Vec<EntrySummary>> + Send {
        (**self).summary()
    }

    fn close_all(&self) -> impl Future<Output = ()> + Send {
        (**self).close_all()
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendType, PreparedQuery, RowSet};
    use std::sync::atomic::AtomicBool;

    #[derive(Clone)]
    struct FakeHandle {
        id: usize,
        closed: Arc<AtomicBool>,
    }

    impl Backend for FakeHandle {
        fn backend_type(&self) -> BackendType {
            BackendType::Postgres
        }

        async fn run(&self, _query: &PreparedQuery) -> DbResult<RowSet> {
            Ok(RowSet::default())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
    }

    impl Connector for Arc<CountingConnector> {
        type Handle = FakeHandle;

        async fn connect(&self, _config: &BackendConfig) -> DbResult<FakeHandle> {
            // Widen the race window for single-flight tests
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(DbError::connection("refused", "start it"));
            }
            let id = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeHandle {
                id,
                closed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    fn settings(ttl: Duration, max_entries: usize) -> PoolSettings {
        PoolSettings {
            ttl,
            sweep_interval: Duration::from_secs(3600),
            max_entries,
        }
    }

    fn config(url: &str) -> BackendConfig {
        BackendConfig::new(BackendType::Postgres, url)
    }

    #[tokio::test]
    async fn test_same_config_reuses_handle() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let a = pool.get(&config("postgres://h/db")).await.unwrap();
        let b = pool.get(&config("postgres://h/db")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_different_urls_get_different_handles() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let a = pool.get(&config("postgres://h/one")).await.unwrap();
        let b = pool.get(&config("postgres://h/two")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_connect_once() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                pool.get(&config("postgres://h/db")).await.map(|h| h.id)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 0);
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_not_cached() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        connector.fail.store(true, Ordering::SeqCst);
        assert!(pool.get(&config("postgres://h/db")).await.is_err());
        assert_eq!(pool.size().await, 0);
        assert!(pool.entries.read().await.is_empty());

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.get(&config("postgres://h/db")).await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_tracks_active_count() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let lease = pool.get(&config("postgres://h/db")).await.unwrap();
        assert_eq!(pool.summary().await[0].active, 1);
        drop(lease);
        assert_eq!(pool.summary().await[0].active, 0);
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_entries() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::ZERO, 0));

        let lease = pool.get(&config("postgres://h/db")).await.unwrap();
        let closed = Arc::clone(&lease.closed);
        drop(lease);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(pool.sweep().await, 1);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.size().await, 0);

        // A later request opens a fresh handle
        let again = pool.get(&config("postgres://h/db")).await.unwrap();
        assert_eq!(again.id, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_active_entries() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::ZERO, 0));

        let lease = pool.get(&config("postgres://h/db")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.sweep().await, 0);
        assert!(!lease.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_max_entries_evicts_least_recently_used() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 2));

        let first = pool.get(&config("postgres://h/one")).await.unwrap();
        let first_closed = Arc::clone(&first.closed);
        drop(first);
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.get(&config("postgres://h/two")).await.unwrap());

        drop(pool.get(&config("postgres://h/three")).await.unwrap());
        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn test_max_entries_full_of_active_leases() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 1));

        let _held = pool.get(&config("postgres://h/one")).await.unwrap();
        let err = pool.get(&config("postgres://h/two")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_close_all_empties_cache() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let lease = pool.get(&config("postgres://h/db")).await.unwrap();
        let closed = Arc::clone(&lease.closed);
        drop(lease);

        pool.close_all().await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn test_summary_masks_credentials() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        drop(pool.get(&config("postgres://user:secret@h/db")).await.unwrap());
        let summary = pool.summary().await;
        assert_eq!(summary.len(), 1);
        assert!(!summary[0].key.contains("secret"));
        assert_eq!(summary[0].backend, "postgres");
    }

    #[tokio::test]
    async fn test_cell_removed_during_connect_is_not_leased() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector), settings(Duration::from_secs(60), 0));

        let pending = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get(&config("postgres://h/db")).await })
        };
        // Connect is still sleeping when the cache is drained
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.close_all().await;

        let lease = pending.await.unwrap().unwrap();
        assert_eq!(lease.id, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size().await, 1);
        assert_eq!(pool.summary().await[0].active, 1);
    }

    #[test]
    fn test_entry_active_count_saturates() {
        let entry = PoolEntry::new("postgres:x".to_string(), ());
        entry.increment_active();
        entry.decrement_active();
        entry.decrement_active();
        assert_eq!(entry.active_count(), 0);
    }

    #[test]
    fn test_detached_handle_has_no_lease() {
        let handle = PooledHandle::<u8>::detached(7);
        assert_eq!(*handle.handle(), 7);
    }
}
