use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{MessageStore, StorageEntry, StorageError, StoredMessage};
use crate::transaction::{TransactionHandle, TransactionOutcome};

#[derive(Debug)]
struct StoreInner {
    name: String,
    /// Serialized entries by storage key, in storage order
    entries: Mutex<IndexMap<String, String>>,
    next_key: AtomicU64,
    available: AtomicBool,
}

/// In-memory message store.
///
/// Writes made under an active transaction are applied when it commits and
/// discarded when it rolls back; reads only see committed entries.
#[derive(Debug, Clone)]
pub struct InMemoryMessageStore {
    inner: Arc<StoreInner>,
}

enum Write {
    Insert(String, String),
    Delete(String),
}

impl InMemoryMessageStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                entries: Mutex::new(IndexMap::new()),
                next_key: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Make every operation fail with [`StorageError::Unavailable`] while `false`
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Number of committed entries, without going through a transaction
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.inner.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(self.inner.name.clone()))
        }
    }

    fn apply(inner: &StoreInner, write: Write) {
        let mut entries = inner.entries.lock();
        match write {
            Write::Insert(key, value) => {
                entries.insert(key, value);
            }
            Write::Delete(key) => {
                entries.shift_remove(&key);
            }
        }
    }

    /// Apply now, or at commit when a transaction is active
    fn write(&self, tx: &TransactionHandle, write: Write) {
        if !tx.is_active() {
            Self::apply(&self.inner, write);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let deferred = Arc::new(Mutex::new(Some(write)));
        let pending = Arc::clone(&deferred);
        let registered = tx.register_synchronization(Box::new(move |outcome| {
            if outcome == TransactionOutcome::Committed {
                if let Some(write) = pending.lock().take() {
                    Self::apply(&inner, write);
                }
            } else {
                debug!(store = %inner.name, "Discarding write of rolled back transaction");
            }
        }));
        // the transaction completed in between; nothing is left to defer to
        if !registered {
            if let Some(write) = deferred.lock().take() {
                Self::apply(&self.inner, write);
            }
        }
    }

    fn read_entry(&self, storage_key: &str) -> Result<StoredMessage, StorageError> {
        let entries = self.inner.entries.lock();
        let json = entries
            .get(storage_key)
            .ok_or_else(|| StorageError::NotFound(storage_key.to_string()))?;
        Ok(StoredMessage {
            storage_key: storage_key.to_string(),
            entry: serde_json::from_str(json)?,
        })
    }

    fn any_entry(&self, predicate: impl Fn(&StorageEntry) -> bool) -> Result<bool, StorageError> {
        let entries = self.inner.entries.lock();
        for json in entries.values() {
            let entry: StorageEntry = serde_json::from_str(json)?;
            if predicate(&entry) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn store_message(
        &self,
        tx: &TransactionHandle,
        entry: StorageEntry,
    ) -> Result<String, StorageError> {
        self.check_available()?;
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed).to_string();
        let json = serde_json::to_string(&entry)?;
        self.write(tx, Write::Insert(key.clone(), json));
        debug!(store = %self.inner.name, storage_key = %key, message_id = %entry.message_id, "Stored message");
        Ok(key)
    }

    async fn contains_message_id(
        &self,
        _tx: &TransactionHandle,
        message_id: &str,
    ) -> Result<bool, StorageError> {
        self.check_available()?;
        self.any_entry(|entry| entry.message_id == message_id)
    }

    async fn contains_correlation_id(
        &self,
        _tx: &TransactionHandle,
        correlation_id: &str,
    ) -> Result<bool, StorageError> {
        self.check_available()?;
        self.any_entry(|entry| entry.correlation_id == correlation_id)
    }

    async fn browse_message(
        &self,
        _tx: &TransactionHandle,
        storage_key: &str,
    ) -> Result<StoredMessage, StorageError> {
        self.check_available()?;
        self.read_entry(storage_key)
    }

    async fn delete_message(
        &self,
        tx: &TransactionHandle,
        storage_key: &str,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        if !self.inner.entries.lock().contains_key(storage_key) {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }
        self.write(tx, Write::Delete(storage_key.to_string()));
        Ok(())
    }

    async fn update_comment(
        &self,
        tx: &TransactionHandle,
        storage_key: &str,
        comments: &str,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let mut stored = self.read_entry(storage_key)?;
        stored.entry.comments = comments.to_string();
        let json = serde_json::to_string(&stored.entry)?;
        self.write(tx, Write::Insert(storage_key.to_string(), json));
        Ok(())
    }

    async fn message_count(&self, _tx: &TransactionHandle) -> Result<usize, StorageError> {
        self.check_available()?;
        Ok(self.len())
    }

    async fn list_messages(&self, _tx: &TransactionHandle) -> Result<Vec<StoredMessage>, StorageError> {
        self.check_available()?;
        let entries = self.inner.entries.lock();
        entries
            .iter()
            .map(|(key, json)| {
                Ok(StoredMessage {
                    storage_key: key.clone(),
                    entry: serde_json::from_str(json)?,
                })
            })
            .collect()
    }
}
