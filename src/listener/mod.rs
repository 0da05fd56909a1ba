//! # Listener Contracts
//!
//! A receiver is fed by either a pulling listener (polled by the
//! [`PullingListenerContainer`](crate::pulling::PullingListenerContainer)) or a
//! pushing listener that calls back into the receiver through a
//! [`MessageHandler`].
//!
//! Optional abilities (peeking, process states, delivery counting) are exposed
//! through `as_*` accessors and resolved once into [`ListenerCapabilities`]
//! when the receiver is configured.

pub mod capabilities;
pub mod in_process;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::adapter::PipeLineResult;
use crate::error::{ListenerError, ReceiverError};
use crate::message::{Message, PipeLineSession, RawMessageWrapper, ReceivedMessage};
use crate::receiver::ProcessOutcome;
use crate::state_machine::ProcessState;
use crate::transaction::TransactionHandle;

pub use capabilities::ListenerCapabilities;
pub use in_process::InProcessListener;

/// Bound for raw transport message types
pub trait RawPayload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> RawPayload for T {}

/// Per-task resources a pulling listener keeps between `open_thread` and `close_thread`
pub type ThreadContext = HashMap<String, Value>;

/// Inbound channel of a receiver
#[async_trait]
pub trait Listener<M: RawPayload>: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<(), ListenerError>;

    async fn close(&self) -> Result<(), ListenerError>;

    /// Materialize the payload of a raw message
    fn extract_message(&self, raw: &RawMessageWrapper<M>) -> Result<Message, ListenerError>;

    /// Called after every processed message, whatever the outcome
    async fn after_message_processed(
        &self,
        _result: &PipeLineResult,
        _message: &ReceivedMessage<M>,
        _session: &PipeLineSession,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Whether the transport redelivers failed messages by itself, so they
    /// need not be moved to error storage
    fn redelivers_on_failure(&self) -> bool {
        false
    }

    fn as_peekable(self: Arc<Self>) -> Option<Arc<dyn PeekableListener<M>>> {
        None
    }

    fn as_process_state(self: Arc<Self>) -> Option<Arc<dyn HasProcessState<M>>> {
        None
    }

    fn as_delivery_count(self: Arc<Self>) -> Option<Arc<dyn KnowsDeliveryCount<M>>> {
        None
    }
}

/// Listener that has to be polled for messages
#[async_trait]
pub trait PullingListener<M: RawPayload>: Listener<M> {
    /// Allocate the resources of one listen task
    async fn open_thread(&self) -> Result<ThreadContext, ListenerError>;

    async fn close_thread(&self, context: ThreadContext) -> Result<(), ListenerError>;

    /// Retrieve the next message, or `None` when the source is empty
    async fn get_raw_message(
        &self,
        tx: &TransactionHandle,
        context: &mut ThreadContext,
    ) -> Result<Option<RawMessageWrapper<M>>, ListenerError>;
}

/// Listener that delivers messages by calling its handler
#[async_trait]
pub trait PushingListener<M: RawPayload>: Listener<M> {
    fn set_handler(&self, handler: Arc<dyn MessageHandler<M>>);
}

/// Non-consuming availability check, used before a transaction is opened
#[async_trait]
pub trait PeekableListener<M: RawPayload>: Send + Sync {
    async fn has_raw_message_available(&self) -> Result<bool, ListenerError>;
}

/// Listener that tracks AVAILABLE / IN_PROCESS / DONE / ERROR states of its messages
#[async_trait]
pub trait HasProcessState<M: RawPayload>: Send + Sync {
    fn known_process_states(&self) -> HashSet<ProcessState>;

    /// Move a message to `to`; returns whether the state changed
    async fn change_process_state(
        &self,
        tx: &TransactionHandle,
        message: &ReceivedMessage<M>,
        to: ProcessState,
        reason: &str,
    ) -> Result<bool, ListenerError>;
}

/// Listener that knows how often the transport delivered a message
pub trait KnowsDeliveryCount<M: RawPayload>: Send + Sync {
    /// 1-based delivery count
    fn get_delivery_count(&self, raw: &RawMessageWrapper<M>) -> i32;
}

/// Callback a pushing listener hands its messages to
#[async_trait]
pub trait MessageHandler<M: RawPayload>: Send + Sync {
    /// Process a message inside the caller's transaction
    async fn process_raw_message(
        &self,
        raw: RawMessageWrapper<M>,
        tx: &TransactionHandle,
    ) -> Result<ProcessOutcome, ReceiverError>;

    /// Request/reply: process the message and return the pipeline result
    async fn process_request(&self, raw: RawMessageWrapper<M>) -> Result<Message, ReceiverError>;
}
