use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::constants::context_keys;
use crate::state_machine::ExitState;

/// Per-message key/value session handed to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeLineSession {
    values: HashMap<String, Value>,
}

impl PipeLineSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session seeded with a message context
    pub fn from_context(context: &IndexMap<String, Value>) -> Self {
        Self {
            values: context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_str(context_keys::MESSAGE_ID)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get_str(context_keys::CORRELATION_ID)
    }

    pub fn is_manual_retry(&self) -> bool {
        self.get(context_keys::MANUAL_RETRY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Record the ids, receive time and retry flag of the message being processed
    pub(crate) fn populate(
        &mut self,
        message_id: &str,
        correlation_id: &str,
        received: DateTime<Utc>,
        manual_retry: bool,
    ) {
        self.insert(context_keys::MESSAGE_ID, message_id);
        self.insert(context_keys::CORRELATION_ID, correlation_id);
        self.insert(context_keys::TS_RECEIVED, received.to_rfc3339());
        self.insert(context_keys::MANUAL_RETRY, manual_retry);
    }

    /// Number of times the message was delivered, as known before the pipeline ran
    pub fn delivery_count(&self) -> Option<i64> {
        self.get(context_keys::DELIVERY_COUNT).and_then(Value::as_i64)
    }

    pub fn exit_state(&self) -> Option<&str> {
        self.get_str(context_keys::EXIT_STATE)
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.get(context_keys::EXIT_CODE).and_then(Value::as_i64)
    }

    pub(crate) fn record_delivery_count(&mut self, delivery_count: i32) {
        self.insert(context_keys::DELIVERY_COUNT, delivery_count);
    }

    /// Record how the pipeline ended; a missing exit code clears a stale one
    pub(crate) fn record_exit(&mut self, state: ExitState, exit_code: Option<i32>) {
        self.insert(context_keys::EXIT_STATE, state.to_string());
        match exit_code {
            Some(code) => {
                self.insert(context_keys::EXIT_CODE, code);
            }
            None => {
                self.remove(context_keys::EXIT_CODE);
            }
        }
    }
}
