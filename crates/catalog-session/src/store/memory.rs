//! In-process shared medium (for tests and single-process hosts)

use super::{SharedStore, StoreChange, StoreError, StoreHealth, StoreResult, WATCH_CHANNEL_CAPACITY};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Origin used for writes injected from outside any context
const EXTERNAL_ORIGIN: u64 = 0;

struct Watcher {
    origin: u64,
    key: String,
    tx: mpsc::Sender<StoreChange>,
}

#[derive(Default)]
struct MediumInner {
    data: RwLock<HashMap<String, String>>,
    watchers: RwLock<Vec<Watcher>>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    latency_ms: AtomicU64,
    self_echo: AtomicBool,
    next_origin: AtomicU64,
}

/// The shared medium itself. Every context gets its own handle through
/// [`MemoryMedium::connect`]; a mutation is announced to every handle
/// except the one that made it.
#[derive(Clone)]
pub struct MemoryMedium {
    inner: Arc<MediumInner>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        let inner = MediumInner::default();
        inner.next_origin.store(EXTERNAL_ORIGIN + 1, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Delay every operation by `latency` before it touches the data
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Open a handle for one execution context
    pub fn connect(&self) -> MemoryStore {
        let origin = self.inner.next_origin.fetch_add(1, Ordering::SeqCst);
        MemoryStore {
            origin,
            medium: self.inner.clone(),
        }
    }

    /// Simulate the medium being disabled by host policy
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail with `WriteFailed`
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Also announce mutations to the handle that made them
    pub fn set_self_echo(&self, enabled: bool) {
        self.inner.self_echo.store(enabled, Ordering::SeqCst);
    }

    /// Read a key directly, bypassing availability and latency
    pub async fn peek(&self, key: &str) -> Option<String> {
        self.inner.data.read().await.get(key).cloned()
    }

    /// Write a key as an outside party; every handle is notified
    pub async fn inject(&self, key: &str, value: Option<String>) {
        {
            let mut data = self.inner.data.write().await;
            match &value {
                Some(v) => data.insert(key.to_string(), v.clone()),
                None => data.remove(key),
            };
        }
        self.inner.notify(EXTERNAL_ORIGIN, key, value).await;
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl MediumInner {
    async fn delay(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory medium disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.check_available()?;
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::WriteFailed("injected write failure".to_string()));
        }
        Ok(())
    }

    async fn notify(&self, origin: u64, key: &str, new_value: Option<String>) {
        let self_echo = self.self_echo.load(Ordering::SeqCst);
        let mut watchers = self.watchers.write().await;
        watchers.retain(|watcher| !watcher.tx.is_closed());

        for watcher in watchers.iter() {
            if watcher.key != key || (watcher.origin == origin && !self_echo) {
                continue;
            }
            let change = StoreChange {
                key: key.to_string(),
                new_value: new_value.clone(),
            };
            if let Err(e) = watcher.tx.try_send(change) {
                tracing::warn!("Dropping change notification for key {}: {}", key, e);
            }
        }
    }
}

/// One context's handle onto a [`MemoryMedium`]
#[derive(Clone)]
pub struct MemoryStore {
    origin: u64,
    medium: Arc<MediumInner>,
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.medium.delay().await;
        self.medium.check_available()?;
        Ok(self.medium.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.medium.delay().await;
        self.medium.check_write()?;
        self.medium
            .data
            .write()
            .await
            .insert(key.to_string(), value.clone());

        self.medium.notify(self.origin, key, Some(value)).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.medium.delay().await;
        self.medium.check_write()?;
        let old_value = self.medium.data.write().await.remove(key);

        if old_value.is_some() {
            self.medium.notify(self.origin, key, None).await;
        }
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> StoreResult<mpsc::Receiver<StoreChange>> {
        self.medium.check_available()?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.medium.watchers.write().await.push(Watcher {
            origin: self.origin,
            key: key.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn health_check(&self) -> StoreResult<StoreHealth> {
        let start = std::time::Instant::now();
        let available = self.medium.check_available();
        let _ = self.medium.data.read().await;
        let latency = start.elapsed();

        Ok(StoreHealth {
            healthy: available.is_ok(),
            latency_ms: latency.as_millis() as u64,
            error: available.err().map(|e| e.to_string()),
            metadata: {
                let mut meta = HashMap::new();
                meta.insert("backend".to_string(), "memory".to_string());
                meta.insert("origin".to_string(), self.origin.to_string());
                meta
            },
        })
    }
}
