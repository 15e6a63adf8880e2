//! Directory-backed shared store for contexts in separate OS processes

use super::{
    EchoFilter, SharedStore, StoreChange, StoreError, StoreHealth, StoreResult,
    WATCH_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// One file per key inside a shared directory.
///
/// Writes go to a temporary file that is renamed over the key file, so a
/// reader sees either the old or the new value. Changes are detected by
/// polling every `poll_interval`.
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    poll_interval: Duration,
    echoes: EchoFilter,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(dir: P, poll_interval: Duration) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            dir,
            poll_interval,
            echoes: EchoFilter::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

fn read_error(path: &Path, err: std::io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::PermissionDenied => {
            StoreError::Unavailable(format!("{}: {}", path.display(), err))
        }
        _ => StoreError::Backend(format!("{}: {}", path.display(), err)),
    }
}

fn write_error(path: &Path, err: std::io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::PermissionDenied => {
            StoreError::Unavailable(format!("{}: {}", path.display(), err))
        }
        _ => StoreError::WriteFailed(format!("{}: {}", path.display(), err)),
    }
}

async fn read_value(path: &Path) -> StoreResult<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(read_error(path, e)),
    }
}

#[async_trait]
impl SharedStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        read_value(&self.path_for(key)).await
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4()));

        self.echoes.record(key, Some(value.clone())).await;
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| write_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_error(&path, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        self.echoes.record(key, None).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_error(&path, e)),
        }
    }

    async fn subscribe(&self, key: &str) -> StoreResult<mpsc::Receiver<StoreChange>> {
        let path = self.path_for(key);
        let mut last_seen = read_value(&path).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let echoes = self.echoes.clone();
        let poll_interval = self.poll_interval;
        let key = key.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let current = match read_value(&path).await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::debug!("Polling {} failed: {}", path.display(), e);
                        continue;
                    }
                };
                if current == last_seen {
                    continue;
                }
                last_seen = current.clone();

                if echoes.is_own_echo(&key, &current).await {
                    continue;
                }

                let change = StoreChange {
                    key: key.clone(),
                    new_value: current,
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
        let dir_stat = tokio::fs::metadata(&self.dir).await;
        let latency = start.elapsed();

        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "file".to_string());
        metadata.insert("dir".to_string(), self.dir.display().to_string());

        Ok(StoreHealth {
            healthy: dir_stat.as_ref().map(|m| m.is_dir()).unwrap_or(false),
            latency_ms: latency.as_millis() as u64,
            error: dir_stat.err().map(|e| e.to_string()),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_file_store_operations() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path(), Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(store.get("session/lease").await.unwrap(), None);
        store.set("session/lease", "v1".to_string()).await.unwrap();
        assert_eq!(
            store.get("session/lease").await.unwrap(),
            Some("v1".to_string())
        );
        assert!(temp_dir.path().join("session_lease.json").exists());

        store.remove("session/lease").await.unwrap();
        store.remove("session/lease").await.unwrap();
        assert_eq!(store.get("session/lease").await.unwrap(), None);

        let health = store.health_check().await.unwrap();
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_file_store_watch_between_handles() {
        let temp_dir = tempdir().unwrap();
        let first = FileStore::open(temp_dir.path(), Duration::from_millis(20))
            .await
            .unwrap();
        let second = FileStore::open(temp_dir.path(), Duration::from_millis(20))
            .await
            .unwrap();

        let mut own = first.subscribe("lease").await.unwrap();
        let mut theirs = second.subscribe("lease").await.unwrap();

        first.set("lease", "from-first".to_string()).await.unwrap();
        let change = timeout(Duration::from_secs(2), theirs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.new_value, Some("from-first".to_string()));

        second.remove("lease").await.unwrap();
        let change = timeout(Duration::from_secs(2), own.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.new_value, None);
    }
}
