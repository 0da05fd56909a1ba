//! # Listener Registry
//!
//! Explicitly owned name → handler registry for in-process listeners.
//!
//! The registry is created by the application, passed to every
//! [`InProcessListener`](crate::listener::InProcessListener) that should be
//! reachable through it, and dropped at shutdown. Listeners register on open
//! and unregister on close.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = ListenerRegistry::new();
//! let listener = Arc::new(InProcessListener::new("orders", registry.clone()));
//! // ... configure and start a receiver on `listener` ...
//! let reply = registry.process_request("orders", Message::from("<order/>")).await?;
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ListenerError, ReceiverError};
use crate::message::Message;

/// Synchronous request handler reachable through the registry
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        message_id: Option<String>,
        correlation_id: Option<String>,
        message: Message,
        context: IndexMap<String, Value>,
    ) -> Result<Message, ReceiverError>;
}

/// Thread-safe registry of in-process listeners; clones share the same entries
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a unique name
    pub fn register(&self, name: &str, handler: Arc<dyn RequestHandler>) -> Result<(), ListenerError> {
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ListenerError::AlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(listener = %name, "Registered in-process listener");
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.handlers.remove(name).is_some();
        if removed {
            debug!(listener = %name, "Unregistered in-process listener");
        }
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a request to the listener registered under `name`
    pub async fn process_request(&self, name: &str, message: Message) -> Result<Message, ReceiverError> {
        self.process_request_with_context(name, None, None, message, IndexMap::new())
            .await
    }

    pub async fn process_request_with_context(
        &self,
        name: &str,
        message_id: Option<String>,
        correlation_id: Option<String>,
        message: Message,
        context: IndexMap<String, Value>,
    ) -> Result<Message, ReceiverError> {
        // clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ListenerError::NotRegistered(name.to_string()))?;
        handler
            .handle_request(message_id, correlation_id, message, context)
            .await
    }
}
