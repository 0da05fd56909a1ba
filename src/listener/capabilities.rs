use std::fmt;
use std::sync::Arc;

use super::{HasProcessState, KnowsDeliveryCount, Listener, PeekableListener, RawPayload};
use crate::state_machine::ProcessState;

/// Optional listener abilities, resolved once when the receiver is configured
pub struct ListenerCapabilities<M: RawPayload> {
    pub peekable: Option<Arc<dyn PeekableListener<M>>>,
    pub process_state: Option<Arc<dyn HasProcessState<M>>>,
    pub delivery_count: Option<Arc<dyn KnowsDeliveryCount<M>>>,
    pub redelivering: bool,
}

impl<M: RawPayload> ListenerCapabilities<M> {
    pub fn resolve(listener: &Arc<dyn Listener<M>>) -> Self {
        Self {
            peekable: Arc::clone(listener).as_peekable(),
            process_state: Arc::clone(listener).as_process_state(),
            delivery_count: Arc::clone(listener).as_delivery_count(),
            redelivering: listener.redelivers_on_failure(),
        }
    }

    /// Capabilities of a listener without any optional ability
    pub fn none() -> Self {
        Self {
            peekable: None,
            process_state: None,
            delivery_count: None,
            redelivering: false,
        }
    }

    pub fn supports_process_state(&self, state: ProcessState) -> bool {
        self.process_state
            .as_ref()
            .is_some_and(|listener| listener.known_process_states().contains(&state))
    }

    pub fn counts_deliveries(&self) -> bool {
        self.delivery_count.is_some()
    }
}

impl<M: RawPayload> Clone for ListenerCapabilities<M> {
    fn clone(&self) -> Self {
        Self {
            peekable: self.peekable.clone(),
            process_state: self.process_state.clone(),
            delivery_count: self.delivery_count.clone(),
            redelivering: self.redelivering,
        }
    }
}

impl<M: RawPayload> fmt::Debug for ListenerCapabilities<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerCapabilities")
            .field("peekable", &self.peekable.is_some())
            .field("process_state", &self.process_state.is_some())
            .field("delivery_count", &self.delivery_count.is_some())
            .field("redelivering", &self.redelivering)
            .finish()
    }
}
