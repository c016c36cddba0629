//! Store doubles for failure-injection tests.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use depesche_core::{BoxFuture, Clock, CoreError, KeyValueStore, MemoryStore, Result};

/// A working store that can be switched off and on.
///
/// While switched off every operation, including `ping`, fails with
/// `CoreError::Unavailable`. Data written while available survives the
/// outage, which is what a recovering durable backend looks like.
#[derive(Debug, Clone)]
pub struct SwitchableStore {
    inner: MemoryStore,
    available: Arc<AtomicBool>,
}

impl SwitchableStore {
    /// Creates a switched-on store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { inner: MemoryStore::new(clock), available: Arc::new(AtomicBool::new(true)) }
    }

    /// Switches the store on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoreError::unavailable("store switched off"))
        }
    }
}

impl KeyValueStore for SwitchableStore {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        let this = self.clone();
        let inner = self.inner.get(key);
        Box::pin(async move {
            this.check()?;
            inner.await
        })
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let inner = self.inner.set_with_ttl(key, value, ttl);
        Box::pin(async move {
            this.check()?;
            inner.await
        })
    }

    fn increment(&self, key: &str, ttl: Duration) -> BoxFuture<'static, Result<i64>> {
        let this = self.clone();
        let inner = self.inner.increment(key, ttl);
        Box::pin(async move {
            this.check()?;
            inner.await
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let inner = self.inner.delete(key);
        Box::pin(async move {
            this.check()?;
            inner.await
        })
    }

    fn ping(&self) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.check() })
    }
}

/// A store that fails every operation.
#[derive(Debug, Clone, Default)]
pub struct FailingStore;

impl KeyValueStore for FailingStore {
    fn get(&self, _key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        Box::pin(async { Err(CoreError::unavailable("always down")) })
    }

    fn set_with_ttl(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(CoreError::unavailable("always down")) })
    }

    fn increment(&self, _key: &str, _ttl: Duration) -> BoxFuture<'static, Result<i64>> {
        Box::pin(async { Err(CoreError::unavailable("always down")) })
    }

    fn delete(&self, _key: &str) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(CoreError::unavailable("always down")) })
    }

    fn ping(&self) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(CoreError::unavailable("always down")) })
    }
}
