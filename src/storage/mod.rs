//! # Message Stores
//!
//! Contracts for the error storage and the message log, plus an in-memory
//! implementation. Every operation takes the transaction handle it runs in.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageWrapper;
use crate::transaction::TransactionHandle;

pub use memory::InMemoryMessageStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("No message stored under key {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage {0} is unavailable")]
    Unavailable(String),
    #[error("Storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

/// Message with the metadata it is stored under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub message_id: String,
    pub correlation_id: String,
    pub received: DateTime<Utc>,
    pub comments: String,
    pub message: MessageWrapper,
}

/// Entry as read back from a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub storage_key: String,
    pub entry: StorageEntry,
}

/// Durable key/value store for messages, used as error storage and as message log
#[async_trait]
pub trait MessageStore: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Store a message, returning its storage key
    async fn store_message(
        &self,
        tx: &TransactionHandle,
        entry: StorageEntry,
    ) -> Result<String, StorageError>;

    async fn contains_message_id(
        &self,
        tx: &TransactionHandle,
        message_id: &str,
    ) -> Result<bool, StorageError>;

    async fn contains_correlation_id(
        &self,
        tx: &TransactionHandle,
        correlation_id: &str,
    ) -> Result<bool, StorageError>;

    async fn browse_message(
        &self,
        tx: &TransactionHandle,
        storage_key: &str,
    ) -> Result<StoredMessage, StorageError>;

    async fn delete_message(
        &self,
        tx: &TransactionHandle,
        storage_key: &str,
    ) -> Result<(), StorageError>;

    /// Replace the comments of a stored entry
    async fn update_comment(
        &self,
        tx: &TransactionHandle,
        storage_key: &str,
        comments: &str,
    ) -> Result<(), StorageError>;

    async fn message_count(&self, tx: &TransactionHandle) -> Result<usize, StorageError>;

    /// All stored entries in storage order
    async fn list_messages(&self, tx: &TransactionHandle) -> Result<Vec<StoredMessage>, StorageError>;
}
