//! Sled-backed shared store

use super::{
    EchoFilter, SharedStore, StoreChange, StoreError, StoreHealth, StoreResult,
    WATCH_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;

/// Store over an embedded sled database.
///
/// A sled database is locked to one process, so contexts share it by
/// cloning the `Db` into several handles ([`SledStore::from_db`]). Sled
/// notifies every subscriber including the writer; each handle drops the
/// echoes of its own writes.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    echoes: EchoFilter,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StoreError::Unavailable(format!(
                "failed to open sled database at {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::from_db(db))
    }

    /// New handle onto an already open database
    pub fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            echoes: EchoFilter::default(),
        }
    }

    /// Another context's handle onto the same database
    pub fn handle(&self) -> Self {
        Self::from_db(self.db.clone())
    }
}

fn decode(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

#[async_trait]
impl SharedStore for SledStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StoreError::Backend(format!("sled read failed: {}", e)))?;
        Ok(value.map(|v| decode(&v)))
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.echoes.record(key, Some(value.clone())).await;
        self.db
            .insert(key, value.as_bytes())
            .map_err(|e| StoreError::WriteFailed(format!("sled insert failed: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.echoes.record(key, None).await;
        self.db
            .remove(key)
            .map_err(|e| StoreError::WriteFailed(format!("sled remove failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> StoreResult<mpsc::Receiver<StoreChange>> {
        let mut subscriber = self.db.watch_prefix(key.as_bytes());
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let echoes = self.echoes.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            while let Some(event) = (&mut subscriber).await {
                let new_value = match &event {
                    sled::Event::Insert { key: k, value } if k.as_ref() == key.as_bytes() => {
                        Some(decode(value))
                    }
                    sled::Event::Remove { key: k } if k.as_ref() == key.as_bytes() => None,
                    // Prefix match on a longer key
                    _ => continue,
                };

                if echoes.is_own_echo(&key, &new_value).await {
                    tracing::trace!("Suppressed own sled echo for key {}", key);
                    continue;
                }

                let change = StoreChange {
                    key: key.clone(),
                    new_value,
                };
                if tx.send(change).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> StoreResult<StoreHealth> {
        let start = std::time::Instant::now();
        let size = self.db.size_on_disk();
        let latency = start.elapsed();

        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "sled".to_string());
        metadata.insert("keys".to_string(), self.db.len().to_string());

        Ok(StoreHealth {
            healthy: size.is_ok(),
            latency_ms: latency.as_millis() as u64,
            error: size.err().map(|e| e.to_string()),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_sled_store_persistence() {
        let temp_dir = tempdir().unwrap();
        {
            let store = SledStore::open(temp_dir.path()).unwrap();
            store.set("lease", "persisted".to_string()).await.unwrap();
            store.db.flush_async().await.unwrap();
        }

        let reopened = SledStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            reopened.get("lease").await.unwrap(),
            Some("persisted".to_string())
        );
    }

    #[tokio::test]
    async fn test_sled_watch_skips_own_writes() {
        let temp_dir = tempdir().unwrap();
        let first = SledStore::open(temp_dir.path()).unwrap();
        let second = first.handle();

        let mut own = first.subscribe("lease").await.unwrap();
        let mut theirs = second.subscribe("lease").await.unwrap();

        first.set("lease", "from-first".to_string()).await.unwrap();

        let change = timeout(Duration::from_secs(1), theirs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.new_value, Some("from-first".to_string()));

        second.remove("lease").await.unwrap();
        let change = timeout(Duration::from_secs(1), own.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.new_value, None);
    }

    #[tokio::test]
    async fn test_sled_watch_ignores_longer_keys() {
        let temp_dir = tempdir().unwrap();
        let first = SledStore::open(temp_dir.path()).unwrap();
        let second = first.handle();

        let mut changes = second.subscribe("lease").await.unwrap();
        first.set("lease-other", "x".to_string()).await.unwrap();
        first.set("lease", "y".to_string()).await.unwrap();

        let change = timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.key, "lease");
        assert_eq!(change.new_value, Some("y".to_string()));
    }
}
