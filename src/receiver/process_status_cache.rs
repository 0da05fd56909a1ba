use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::state_machine::ExitState;

/// Processing history of one message id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatusCacheItem {
    /// Deliveries seen so far
    pub receive_count: i32,
    /// First time the message was seen
    pub receive_date: DateTime<Utc>,
    pub comments: Option<String>,
    pub exit_state: Option<ExitState>,
}

/// Bounded, insertion-ordered cache of message histories. The eldest entry is
/// evicted when the capacity is exceeded.
#[derive(Debug)]
pub struct ProcessStatusCache {
    capacity: usize,
    entries: Mutex<IndexMap<String, ProcessStatusCacheItem>>,
}

impl ProcessStatusCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Count a delivery of `message_id`, returning the updated entry
    pub fn record_delivery(&self, message_id: &str, received: DateTime<Utc>) -> ProcessStatusCacheItem {
        let mut entries = self.entries.lock();
        if let Some(item) = entries.get_mut(message_id) {
            item.receive_count += 1;
            return item.clone();
        }

        let item = ProcessStatusCacheItem {
            receive_count: 1,
            receive_date: received,
            comments: None,
            exit_state: None,
        };
        entries.insert(message_id.to_string(), item.clone());
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
        item
    }

    /// Record the final state of an attempt; unknown ids are ignored
    pub fn update(&self, message_id: &str, exit_state: ExitState, comments: Option<String>) {
        if let Some(item) = self.entries.lock().get_mut(message_id) {
            item.exit_state = Some(exit_state);
            item.comments = comments;
        }
    }

    /// Flip a cached SUCCESS to ERROR, used when the transaction of a
    /// successful message rolls back after all
    pub fn flip_success_to_error(&self, message_id: &str, comments: &str) -> bool {
        match self.entries.lock().get_mut(message_id) {
            Some(item) if item.exit_state == Some(ExitState::Success) => {
                item.exit_state = Some(ExitState::Error);
                item.comments = Some(comments.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, message_id: &str) -> Option<ProcessStatusCacheItem> {
        self.entries.lock().get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
