use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use super::{Listener, MessageHandler, PushingListener};
use crate::error::{ListenerError, ReceiverError};
use crate::message::{Message, RawMessageWrapper};
use crate::registry::{ListenerRegistry, RequestHandler};

struct HandlerSlot {
    listener: String,
    handler: RwLock<Option<Arc<dyn MessageHandler<Message>>>>,
}

#[async_trait]
impl RequestHandler for HandlerSlot {
    async fn handle_request(
        &self,
        message_id: Option<String>,
        correlation_id: Option<String>,
        message: Message,
        context: IndexMap<String, Value>,
    ) -> Result<Message, ReceiverError> {
        let handler = self.handler.read().clone().ok_or_else(|| {
            ListenerError::Other(format!("no receiver attached to listener {}", self.listener))
        })?;
        let raw = RawMessageWrapper::with_context(message, message_id, correlation_id, context);
        handler.process_request(raw).await
    }
}

/// Pushing listener reachable by name through a [`ListenerRegistry`]
pub struct InProcessListener {
    name: String,
    registry: ListenerRegistry,
    slot: Arc<HandlerSlot>,
}

impl InProcessListener {
    pub fn new(name: impl Into<String>, registry: ListenerRegistry) -> Self {
        let name = name.into();
        Self {
            slot: Arc::new(HandlerSlot {
                listener: name.clone(),
                handler: RwLock::new(None),
            }),
            name,
            registry,
        }
    }
}

impl std::fmt::Debug for InProcessListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessListener")
            .field("name", &self.name)
            .field("registered", &self.registry.is_registered(&self.name))
            .finish()
    }
}

#[async_trait]
impl Listener<Message> for InProcessListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ListenerError> {
        self.registry.register(&self.name, self.slot.clone())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.registry.unregister(&self.name);
        *self.slot.handler.write() = None;
        Ok(())
    }

    fn extract_message(&self, raw: &RawMessageWrapper<Message>) -> Result<Message, ListenerError> {
        Ok(raw.raw_message().clone())
    }
}

impl PushingListener<Message> for InProcessListener {
    fn set_handler(&self, handler: Arc<dyn MessageHandler<Message>>) {
        *self.slot.handler.write() = Some(handler);
    }
}
