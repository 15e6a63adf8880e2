//! Typed view of the coordination key

use crate::error::{Result, SessionError};
use crate::lease::LeaseRecord;
use crate::store::{SharedStore, StoreChange};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reads, writes and watches the single lease record under one key.
///
/// An unparsable persisted value is treated as if the key were absent, so a
/// corrupted record is reclaimed instead of blocking every context.
#[derive(Clone)]
pub struct LeaseStore {
    store: Arc<dyn SharedStore>,
    key: String,
}

impl LeaseStore {
    pub fn new(store: Arc<dyn SharedStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn shared_store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Current record; malformed values read as `None`
    pub async fn read(&self) -> Result<Option<LeaseRecord>> {
        match self.read_strict().await {
            Err(SessionError::MalformedRecord(msg)) => {
                tracing::warn!("Ignoring malformed lease under {}: {}", self.key, msg);
                Ok(None)
            }
            other => other,
        }
    }

    /// Current record, surfacing `MalformedRecord`
    pub async fn read_strict(&self) -> Result<Option<LeaseRecord>> {
        match self.store.get(&self.key).await? {
            Some(raw) => Ok(Some(LeaseRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn write(&self, record: &LeaseRecord) -> Result<()> {
        let encoded = record.encode()?;
        self.store.set(&self.key, encoded).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(&self.key).await?;
        Ok(())
    }

    /// Subscribe to changes made by other contexts
    pub async fn watch(&self) -> Result<LeaseWatch> {
        let rx = self.store.subscribe(&self.key).await?;
        Ok(LeaseWatch {
            key: self.key.clone(),
            rx,
        })
    }
}

/// Stream of externally written lease values
pub struct LeaseWatch {
    key: String,
    rx: mpsc::Receiver<StoreChange>,
}

impl LeaseWatch {
    /// Next change: `Some(None)` when the record was removed or is
    /// malformed, `None` when the subscription ended.
    pub async fn next(&mut self) -> Option<Option<LeaseRecord>> {
        loop {
            let change = self.rx.recv().await?;
            if change.key != self.key {
                continue;
            }
            return Some(change.new_value.and_then(|raw| match LeaseRecord::decode(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Treating malformed lease change as removal: {}", e);
                    None
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::store::MemoryMedium;
    use chrono::Utc;

    #[tokio::test]
    async fn test_read_write_clear() {
        let medium = MemoryMedium::new();
        let leases = LeaseStore::new(Arc::new(medium.connect()), "lease");

        assert_eq!(leases.read().await.unwrap(), None);

        let record = LeaseRecord::new(PeerId::new(), Utc::now());
        leases.write(&record).await.unwrap();
        assert_eq!(leases.read().await.unwrap(), Some(record));

        leases.clear().await.unwrap();
        assert_eq!(leases.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_reads_as_absent() {
        let medium = MemoryMedium::new();
        let leases = LeaseStore::new(Arc::new(medium.connect()), "lease");
        medium.inject("lease", Some("{not json".to_string())).await;

        assert_eq!(leases.read().await.unwrap(), None);
        assert!(matches!(
            leases.read_strict().await,
            Err(SessionError::MalformedRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_is_reported() {
        let medium = MemoryMedium::new();
        let leases = LeaseStore::new(Arc::new(medium.connect()), "lease");
        medium.set_available(false);

        assert!(matches!(
            leases.read().await,
            Err(SessionError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_decodes_changes() {
        let medium = MemoryMedium::new();
        let writer = LeaseStore::new(Arc::new(medium.connect()), "lease");
        let reader = LeaseStore::new(Arc::new(medium.connect()), "lease");
        let mut watch = reader.watch().await.unwrap();

        let record = LeaseRecord::new(PeerId::new(), Utc::now());
        writer.write(&record).await.unwrap();
        assert_eq!(watch.next().await, Some(Some(record)));

        medium.inject("lease", Some("garbage".to_string())).await;
        assert_eq!(watch.next().await, Some(None));

        writer.clear().await.unwrap();
        assert_eq!(watch.next().await, Some(None));
    }
}
