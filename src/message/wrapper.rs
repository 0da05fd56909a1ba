use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Message;
use crate::constants::context_keys;

/// Raw transport message with its ids and an ordered context.
///
/// A non-empty id or correlation id is always mirrored into the context under
/// `message_id` / `correlation_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessageWrapper<M> {
    raw_message: M,
    id: Option<String>,
    correlation_id: Option<String>,
    context: IndexMap<String, Value>,
}

impl<M> RawMessageWrapper<M> {
    pub fn new(raw_message: M, id: Option<String>, correlation_id: Option<String>) -> Self {
        Self::with_context(raw_message, id, correlation_id, IndexMap::new())
    }

    pub fn with_context(
        raw_message: M,
        id: Option<String>,
        correlation_id: Option<String>,
        context: IndexMap<String, Value>,
    ) -> Self {
        let mut wrapper = Self {
            raw_message,
            id: None,
            correlation_id: None,
            context,
        };
        wrapper.set_id(id);
        wrapper.set_correlation_id(correlation_id);
        wrapper
    }

    pub fn raw_message(&self) -> &M {
        &self.raw_message
    }

    pub fn into_raw_message(self) -> M {
        self.raw_message
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn context(&self) -> &IndexMap<String, Value> {
        &self.context
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = non_empty(id);
        mirror(&mut self.context, context_keys::MESSAGE_ID, self.id.as_deref());
    }

    pub fn set_correlation_id(&mut self, correlation_id: Option<String>) {
        self.correlation_id = non_empty(correlation_id);
        mirror(
            &mut self.context,
            context_keys::CORRELATION_ID,
            self.correlation_id.as_deref(),
        );
    }

    /// Add a context entry; the id keys are routed through their setters
    pub fn insert_context(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            context_keys::MESSAGE_ID => self.set_id(value.as_str().map(str::to_string)),
            context_keys::CORRELATION_ID => {
                self.set_correlation_id(value.as_str().map(str::to_string))
            }
            _ => {
                self.context.insert(key, value);
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn mirror(context: &mut IndexMap<String, Value>, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            context.insert(key.to_string(), Value::from(value));
        }
        None => {
            context.shift_remove(key);
        }
    }
}

/// Materialized message with its ids and context, serializable to a message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWrapper {
    message: Message,
    id: Option<String>,
    correlation_id: Option<String>,
    #[serde(default)]
    context: IndexMap<String, Value>,
}

impl MessageWrapper {
    pub fn new(message: Message, id: Option<String>, correlation_id: Option<String>) -> Self {
        Self::from_raw(&RawMessageWrapper::new((), id, correlation_id), message)
    }

    /// Wrap an extracted message, keeping the ids and context of its raw origin
    pub fn from_raw<M>(raw: &RawMessageWrapper<M>, message: Message) -> Self {
        Self {
            message,
            id: raw.id.clone(),
            correlation_id: raw.correlation_id.clone(),
            context: raw.context.clone(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn context(&self) -> &IndexMap<String, Value> {
        &self.context
    }

    /// Raw view whose payload is the wrapped message
    pub fn as_raw(&self) -> RawMessageWrapper<Message> {
        RawMessageWrapper::with_context(
            self.message.clone(),
            self.id.clone(),
            self.correlation_id.clone(),
            self.context.clone(),
        )
    }

    /// Copy with a different payload, used when masking before storage
    pub fn with_message(&self, message: Message) -> Self {
        Self {
            message,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Message as handed to the receiver: straight from the listener, or re-read
/// from error storage for a manual retry
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedMessage<M> {
    Raw(RawMessageWrapper<M>),
    Stored(MessageWrapper),
}

impl<M> ReceivedMessage<M> {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Raw(raw) => raw.id(),
            Self::Stored(wrapper) => wrapper.id(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Raw(raw) => raw.correlation_id(),
            Self::Stored(wrapper) => wrapper.correlation_id(),
        }
    }

    pub fn context(&self) -> &IndexMap<String, Value> {
        match self {
            Self::Raw(raw) => raw.context(),
            Self::Stored(wrapper) => wrapper.context(),
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored(_))
    }

    pub fn as_raw(&self) -> Option<&RawMessageWrapper<M>> {
        match self {
            Self::Raw(raw) => Some(raw),
            Self::Stored(_) => None,
        }
    }

    /// The message id, synthesizing and recording a random one when absent
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().to_string();
        match self {
            Self::Raw(raw) => raw.set_id(Some(id.clone())),
            Self::Stored(wrapper) => {
                wrapper.id = Some(id.clone());
                mirror(&mut wrapper.context, context_keys::MESSAGE_ID, Some(&id));
            }
        }
        id
    }
}

impl<M> From<RawMessageWrapper<M>> for ReceivedMessage<M> {
    fn from(raw: RawMessageWrapper<M>) -> Self {
        Self::Raw(raw)
    }
}

impl<M> From<MessageWrapper> for ReceivedMessage<M> {
    fn from(wrapper: MessageWrapper) -> Self {
        Self::Stored(wrapper)
    }
}
