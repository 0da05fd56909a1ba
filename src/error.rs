//! Error types for the receiver core.
//!

use crate::config::ConfigurationError;
use crate::sender::SenderError;
use crate::storage::StorageError;
use crate::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Message {message_id} rejected: {reason}")]
    Rejected { message_id: String, reason: String },
    #[error("Retry of message [{storage_key}] failed: {reason}")]
    RetryFailed { storage_key: String, reason: String },
}

impl From<ConfigurationError> for ReceiverError {
    fn from(error: ConfigurationError) -> Self {
        ReceiverError::Configuration(error.to_string())
    }
}

impl From<serde_json::Error> for ReceiverError {
    fn from(error: serde_json::Error) -> Self {
        ReceiverError::Storage(StorageError::Serialization(error.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, ReceiverError>;

/// Errors raised by listener implementations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ListenerError {
    #[error("Failed to open listener {name}: {reason}")]
    OpenFailed { name: String, reason: String },
    #[error("Failed to retrieve message: {0}")]
    Retrieval(String),
    #[error("Failed to extract message {message_id}: {reason}")]
    Extraction { message_id: String, reason: String },
    #[error("Process state transition to {target} failed for {message_id}: {reason}")]
    ProcessState {
        message_id: String,
        target: String,
        reason: String,
    },
    #[error("Listener {0} is not registered")]
    NotRegistered(String),
    #[error("Listener {0} is already registered")]
    AlreadyRegistered(String),
    #[error("Listener error: {0}")]
    Other(String),
}

/// Errors raised by the pipeline executing a message
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Pipeline of adapter {adapter} failed for message {message_id}: {reason}")]
    ProcessingFailed {
        adapter: String,
        message_id: String,
        reason: String,
    },
    #[error("Adapter {0} is not running")]
    AdapterNotRunning(String),
}
