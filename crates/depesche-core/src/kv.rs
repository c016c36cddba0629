//! Key-value store contract and its backends.
//!
//! The delivery system needs four primitives from shared storage: get,
//! set-with-TTL, atomic increment, and delete. `RedisStore` provides the
//! durable backend, `MemoryStore` the in-process degraded mode, and
//! `FallbackStore` the policy that switches between them.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::{CoreError, Result},
    metrics::Metrics,
    time::Clock,
};

/// Boxed future type used by the storage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Narrow contract over the shared key-value store.
///
/// Implementations must make `increment` a single atomic
/// read-modify-write at the storage layer. A separate check followed by
/// a separate write would let concurrent callers pass a limit they
/// should not.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetches a value, or `None` when absent or expired.
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>>;

    /// Stores a value with an expiry, overwriting any prior value.
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'static, Result<()>>;

    /// Atomically increments a counter, stamping `ttl` on first touch.
    ///
    /// Returns the post-increment value.
    fn increment(&self, key: &str, ttl: Duration) -> BoxFuture<'static, Result<i64>>;

    /// Removes a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> BoxFuture<'static, Result<()>>;

    /// Cheap reachability probe.
    fn ping(&self) -> BoxFuture<'static, Result<()>>;
}

/// Durable backend over a shared redis instance.
///
/// Relies on native per-key expiry; nothing is swept from this side.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the store and verifies reachability.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Unavailable` if the instance cannot be
    /// reached or does not answer the initial probe.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::invalid_input(format!("invalid store url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::unavailable(e.to_string()))?;

        let store = Self { manager };
        store.probe().await?;
        Ok(store)
    }

    async fn probe(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn fetch(&self, key: String) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(&key).await?;
        Ok(value)
    }

    async fn store(&self, key: String, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(&key, value, seconds).await?;
        Ok(())
    }

    async fn bump(&self, key: String, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(&key, 1i64).await?;
        if count == 1 {
            let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
            let _: bool = conn.expire(&key, seconds).await?;
        }
        Ok(count)
    }

    async fn remove(&self, key: String) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}

impl KeyValueStore for RedisStore {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.fetch(key).await })
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move { this.store(key, value, ttl).await })
    }

    fn increment(&self, key: &str, ttl: Duration) -> BoxFuture<'static, Result<i64>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.bump(key, ttl).await })
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.remove(key).await })
    }

    fn ping(&self) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.probe().await })
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process map scoped to a single runtime instance.
///
/// Degraded mode only: loses cross-instance consistency and survives no
/// restart. Expiry is checked lazily on every read, so no background
/// sweep is needed; absence-on-read is equivalent to expiry.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty in-process store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    async fn fetch(&self, key: String) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            },
            None => Ok(None),
        }
    }

    async fn store(&self, key: String, value: String, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.lock().await;
        entries.insert(key, MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn bump(&self, key: String, ttl: Duration) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let count = match entries.get(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.value.parse::<i64>().map_err(|e| {
                    CoreError::Serialization(format!("counter {key} is not numeric: {e}"))
                })? + 1
            },
            _ => 1,
        };
        let expires_at = if count == 1 {
            now + ttl
        } else {
            // Keep the expiry stamped on first touch.
            entries.get(&key).map_or(now + ttl, |e| e.expires_at)
        };
        entries.insert(key, MemoryEntry { value: count.to_string(), expires_at });
        Ok(count)
    }

    async fn remove(&self, key: String) -> Result<()> {
        self.entries.lock().await.remove(&key);
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.fetch(key).await })
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move { this.store(key, value, ttl).await })
    }

    fn increment(&self, key: &str, ttl: Duration) -> BoxFuture<'static, Result<i64>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.bump(key, ttl).await })
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.remove(key).await })
    }

    fn ping(&self) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

enum Selected {
    Primary(Arc<dyn KeyValueStore>),
    Fallback,
}

/// Durable store with transparent in-process fallback.
///
/// Prefers the durable backend. Any failed operation flips the store
/// into degraded mode; while degraded, every operation first re-probes
/// the durable backend and switches back as soon as it answers. Probe
/// traffic is therefore bounded by actual usage.
#[derive(Clone)]
pub struct FallbackStore {
    primary: Option<Arc<dyn KeyValueStore>>,
    fallback: MemoryStore,
    degraded: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStore")
            .field("has_primary", &self.primary.is_some())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl FallbackStore {
    /// Wraps a durable backend with an in-process fallback.
    ///
    /// Passing `None` for the primary starts directly in degraded mode,
    /// which is the startup posture when the durable store is down.
    pub fn new(
        primary: Option<Arc<dyn KeyValueStore>>,
        fallback: MemoryStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        let degraded = primary.is_none();
        Self { primary, fallback, degraded: Arc::new(AtomicBool::new(degraded)), metrics }
    }

    /// Whether operations are currently served by the in-process map.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn enter_fallback(&self, err: &CoreError) {
        self.metrics.store.errors.incr();
        if self
            .degraded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.metrics.store.fallback_entered.incr();
            warn!(error = %err, "durable store failed, switching to in-process fallback");
        }
    }

    async fn select(&self) -> Selected {
        let Some(primary) = &self.primary else {
            return Selected::Fallback;
        };
        if !self.is_degraded() {
            return Selected::Primary(primary.clone());
        }
        match primary.ping().await {
            Ok(()) => {
                if self
                    .degraded
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.metrics.store.fallback_recovered.incr();
                    info!("durable store answering again, leaving fallback mode");
                }
                Selected::Primary(primary.clone())
            },
            Err(_) => Selected::Fallback,
        }
    }
}

macro_rules! fallback_op {
    ($this:ident, $key:ident, $call:ident ( $($arg:expr),* )) => {{
        match $this.select().await {
            Selected::Primary(primary) => match primary.$call(&$key, $($arg),*).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    $this.enter_fallback(&err);
                    $this.fallback.$call(&$key, $($arg),*).await
                },
            },
            Selected::Fallback => $this.fallback.$call(&$key, $($arg),*).await,
        }
    }};
}

impl KeyValueStore for FallbackStore {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { fallback_op!(this, key, get()) })
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move { fallback_op!(this, key, set_with_ttl(&value, ttl)) })
    }

    fn increment(&self, key: &str, ttl: Duration) -> BoxFuture<'static, Result<i64>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { fallback_op!(this, key, increment(ttl)) })
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { fallback_op!(this, key, delete()) })
    }

    fn ping(&self) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            match &this.primary {
                Some(primary) => primary.ping().await,
                None => this.fallback.ping().await,
            }
        })
    }
}
