//! # Receiver
//!
//! Couples one listener to one adapter. The receiver owns the message history
//! (delivery counts per message id), duplicate detection against the message
//! log, retry limits with exponential backoff, and moving failed messages to
//! error storage. It also drives its own lifecycle:
//!
//! ```text
//! STOPPED -> STARTING -> STARTED -> STOPPING -> STOPPED
//!               |            |          |
//!               v            v          v
//!      EXCEPTION_STARTING  ERROR  EXCEPTION_STOPPING
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let receiver = ReceiverBuilder::new(config, adapter, transaction_manager)
//!     .pulling_listener(listener)
//!     .error_storage(error_storage)
//!     .build()?;
//! receiver.configure().await?;
//! receiver.start().await?;
//! ```
//!
//! Pulling listeners are polled by a
//! [`PullingListenerContainer`](crate::pulling::PullingListenerContainer)
//! created on start. Pushing listeners get the receiver installed as their
//! [`MessageHandler`](crate::listener::MessageHandler).

pub mod backoff;
pub mod error_handling;
pub mod outcome;
pub mod process_status_cache;
pub mod processing;
pub mod statistics;

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use crate::adapter::Adapter;
use crate::config::{ConfigResult, ConfigurationError, OnError, ReceiverConfig};
use crate::error::{ReceiverError, Result};
use crate::events::{EventPublisher, MonitorEvent};
use crate::listener::{
    Listener, ListenerCapabilities, MessageHandler, PullingListener, PushingListener, RawPayload,
};
use crate::log_receiver;
use crate::message::{CorrelationIdExtractor, MessageCompactor, MessageMasker, RawMessageWrapper};
use crate::pulling::PullingListenerContainer;
use crate::sender::ResultSender;
use crate::state_machine::{ProcessState, RunState, RunStateManager};
use crate::storage::MessageStore;
use crate::transaction::{TransactionDefinition, TransactionManager};

pub use backoff::{BackoffState, BackoffStep};
pub use outcome::ProcessOutcome;
pub use process_status_cache::{ProcessStatusCache, ProcessStatusCacheItem};
pub use statistics::{ReceiverStatistics, StatisticsSnapshot};

/// The listener of a receiver, by how it delivers messages
pub enum ListenerKind<M: RawPayload> {
    Pulling(Arc<dyn PullingListener<M>>),
    Pushing(Arc<dyn PushingListener<M>>),
}

/// Settings derived from configuration and listener capabilities at configure time
pub(crate) struct ResolvedSettings<M: RawPayload> {
    pub(crate) capabilities: ListenerCapabilities<M>,
    pub(crate) max_retries: i32,
    pub(crate) transaction_definition: TransactionDefinition,
    pub(crate) compactor: Option<MessageCompactor>,
    pub(crate) masker: Option<MessageMasker>,
    pub(crate) correlation_extractor: Option<CorrelationIdExtractor>,
}

pub struct Receiver<M: RawPayload> {
    name: String,
    config: ReceiverConfig,
    listener: Arc<dyn Listener<M>>,
    kind: ListenerKind<M>,
    adapter: Arc<dyn Adapter>,
    transaction_manager: Arc<dyn TransactionManager>,
    error_storage: Option<Arc<dyn MessageStore>>,
    message_log: Option<Arc<dyn MessageStore>>,
    sender: Option<Arc<dyn ResultSender>>,
    events: EventPublisher,
    run_state: RunStateManager,
    settings: RwLock<Option<Arc<ResolvedSettings<M>>>>,
    cache: Arc<ProcessStatusCache>,
    backoff: Mutex<BackoffState>,
    statistics: ReceiverStatistics,
    consecutive_exceptions: AtomicU32,
    in_warning: AtomicBool,
    container: tokio::sync::Mutex<Option<PullingListenerContainer<M>>>,
    self_ref: Weak<Receiver<M>>,
}

/// Builder wiring a receiver to its listener and collaborators
pub struct ReceiverBuilder<M: RawPayload> {
    config: ReceiverConfig,
    adapter: Arc<dyn Adapter>,
    transaction_manager: Arc<dyn TransactionManager>,
    listener: Option<(Arc<dyn Listener<M>>, ListenerKind<M>)>,
    error_storage: Option<Arc<dyn MessageStore>>,
    message_log: Option<Arc<dyn MessageStore>>,
    sender: Option<Arc<dyn ResultSender>>,
    events: Option<EventPublisher>,
}

impl<M: RawPayload> ReceiverBuilder<M> {
    pub fn new(
        config: ReceiverConfig,
        adapter: Arc<dyn Adapter>,
        transaction_manager: Arc<dyn TransactionManager>,
    ) -> Self {
        Self {
            config,
            adapter,
            transaction_manager,
            listener: None,
            error_storage: None,
            message_log: None,
            sender: None,
            events: None,
        }
    }

    pub fn pulling_listener<L: PullingListener<M> + 'static>(mut self, listener: Arc<L>) -> Self {
        let base: Arc<dyn Listener<M>> = listener.clone();
        self.listener = Some((base, ListenerKind::Pulling(listener)));
        self
    }

    pub fn pushing_listener<L: PushingListener<M> + 'static>(mut self, listener: Arc<L>) -> Self {
        let base: Arc<dyn Listener<M>> = listener.clone();
        self.listener = Some((base, ListenerKind::Pushing(listener)));
        self
    }

    pub fn error_storage(mut self, storage: Arc<dyn MessageStore>) -> Self {
        self.error_storage = Some(storage);
        self
    }

    pub fn message_log(mut self, log: Arc<dyn MessageStore>) -> Self {
        self.message_log = Some(log);
        self
    }

    pub fn sender(mut self, sender: Arc<dyn ResultSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn event_publisher(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Arc<Receiver<M>>> {
        let (listener, kind) = self.listener.ok_or_else(|| {
            ReceiverError::Configuration(format!(
                "receiver '{}' has no listener",
                self.config.name
            ))
        })?;

        let name = self.config.name.clone();
        let cache_size = self.config.process_result_cache_size;
        let max_backoff = self.config.effective_max_backoff_delay();

        Ok(Arc::new_cyclic(|self_ref| Receiver {
            name,
            listener,
            kind,
            adapter: self.adapter,
            transaction_manager: self.transaction_manager,
            error_storage: self.error_storage,
            message_log: self.message_log,
            sender: self.sender,
            events: self.events.unwrap_or_default(),
            run_state: RunStateManager::default(),
            settings: RwLock::new(None),
            cache: Arc::new(ProcessStatusCache::new(cache_size)),
            backoff: Mutex::new(BackoffState::new(max_backoff)),
            statistics: ReceiverStatistics::new(),
            consecutive_exceptions: AtomicU32::new(0),
            in_warning: AtomicBool::new(false),
            container: tokio::sync::Mutex::new(None),
            self_ref: self_ref.clone(),
            config: self.config,
        }))
    }
}

impl<M: RawPayload> Receiver<M> {
    /// Validate the configuration and resolve the listener capabilities.
    ///
    /// A configuration problem leaves the receiver in ERROR.
    pub async fn configure(&self) -> Result<()> {
        match self.resolve_settings() {
            Ok(settings) => {
                *self.backoff.lock() = BackoffState::new(self.config.effective_max_backoff_delay());
                log_receiver!(
                    info,
                    "CONFIGURED",
                    receiver: self.name,
                    max_retries: settings.max_retries,
                    transaction_attribute: self.config.transaction_attribute,
                    capabilities: settings.capabilities,
                );
                *self.settings.write() = Some(Arc::new(settings));
                Ok(())
            }
            Err(e) => {
                error!(receiver = %self.name, error = %e, "Receiver configuration failed");
                self.set_run_state(RunState::Error).await;
                Err(e.into())
            }
        }
    }

    fn resolve_settings(&self) -> ConfigResult<ResolvedSettings<M>> {
        self.config.validate()?;

        if self.config.check_for_duplicates && self.message_log.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "message_log",
                format!("duplicate check of receiver '{}'", self.name),
            ));
        }

        let capabilities = ListenerCapabilities::resolve(&self.listener);
        if capabilities.process_state.is_some()
            && !capabilities.supports_process_state(ProcessState::Error)
            && !capabilities.supports_process_state(ProcessState::Done)
        {
            return Err(ConfigurationError::invalid_value(
                "listener",
                self.listener.name(),
                "a listener with process states must know ERROR or DONE",
            ));
        }

        Ok(ResolvedSettings {
            max_retries: self
                .config
                .effective_max_retries(capabilities.counts_deliveries()),
            transaction_definition: TransactionDefinition::new(
                self.config.transaction_attribute,
                self.config.transaction_timeout(),
            ),
            compactor: MessageCompactor::from_config(&self.config.compaction)?,
            masker: MessageMasker::from_config(
                self.config.hide_regex.as_deref(),
                self.config.hide_method,
            )?,
            correlation_extractor: CorrelationIdExtractor::from_config(&self.config)?,
            capabilities,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let state = self.run_state.get();
        if state.is_running() {
            log_receiver!(info, "START_IGNORED", receiver: self.name, state: state);
            return Ok(());
        }
        if state == RunState::Stopping {
            return Err(ReceiverError::InvalidState(format!(
                "receiver '{}' is still stopping",
                self.name
            )));
        }
        let settings = self.settings()?;
        let adapter_state = self.adapter.run_state();
        if adapter_state != RunState::Started {
            return Err(ReceiverError::InvalidState(format!(
                "adapter '{}' of receiver '{}' is {adapter_state}, not started",
                self.adapter.name(),
                self.name
            )));
        }

        self.set_run_state(RunState::Starting).await;

        if let Err(e) = self.open_resources().await {
            error!(receiver = %self.name, error = %e, "Receiver failed to start");
            self.set_run_state(RunState::ExceptionStarting).await;
            if let Err(close_error) = self.close_resources().await {
                warn!(receiver = %self.name, error = %close_error, "Cleanup after failed start failed");
            }
            return Err(e);
        }

        self.reset_exception_counter();
        self.backoff.lock().reset();
        self.set_run_state(RunState::Started).await;

        if let ListenerKind::Pulling(listener) = &self.kind {
            let receiver = self.self_ref.upgrade().ok_or_else(|| {
                ReceiverError::InvalidState(format!("receiver '{}' is being dropped", self.name))
            })?;
            let container =
                PullingListenerContainer::new(receiver, Arc::clone(listener), &self.config, settings);
            container.start();
            *self.container.lock().await = Some(container);
        }

        log_receiver!(info, "STARTED", receiver: self.name, listener: self.listener.name());
        Ok(())
    }

    async fn open_resources(&self) -> Result<()> {
        if let Some(storage) = &self.error_storage {
            storage.open().await?;
        }
        if let Some(log) = &self.message_log {
            log.open().await?;
        }
        if let Some(sender) = &self.sender {
            sender.open().await?;
        }
        if let ListenerKind::Pushing(listener) = &self.kind {
            let handler: Arc<dyn MessageHandler<M>> = self.self_ref.upgrade().ok_or_else(|| {
                ReceiverError::InvalidState(format!("receiver '{}' is being dropped", self.name))
            })?;
            listener.set_handler(handler);
        }
        self.listener.open().await?;
        Ok(())
    }

    /// Stop receiving. A receiver stopped because it went into ERROR stays in ERROR.
    pub async fn stop(&self) -> Result<()> {
        let state = self.run_state.get();
        if state.is_stopped_or_stopping() {
            log_receiver!(debug, "STOP_IGNORED", receiver: self.name, state: state);
            return Ok(());
        }
        let final_state = if state == RunState::Error {
            RunState::Error
        } else {
            RunState::Stopped
        };

        self.set_run_state(RunState::Stopping).await;

        let container = self.container.lock().await.take();
        if let Some(container) = container {
            container.stop().await;
        }

        match self.close_resources().await {
            Ok(()) => {
                self.set_run_state(final_state).await;
                log_receiver!(info, "STOPPED", receiver: self.name, state: final_state);
                Ok(())
            }
            Err(e) => {
                error!(receiver = %self.name, error = %e, "Receiver failed to stop cleanly");
                self.set_run_state(RunState::ExceptionStopping).await;
                Err(e)
            }
        }
    }

    /// Close everything that was opened; every close is attempted and the first error returned
    async fn close_resources(&self) -> Result<()> {
        let mut first_error: Option<ReceiverError> = None;

        if let Err(e) = self.listener.close().await {
            first_error.get_or_insert(e.into());
        }
        if let Some(sender) = &self.sender {
            if let Err(e) = sender.close().await {
                first_error.get_or_insert(e.into());
            }
        }
        for store in [&self.message_log, &self.error_storage].into_iter().flatten() {
            if let Err(e) = store.close().await {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// React to an unhandled exception according to `on_error`
    pub async fn exception_thrown(
        &self,
        description: &str,
        error: &(dyn std::error::Error + Send + Sync),
    ) {
        match self.config.on_error {
            OnError::Continue => {
                let count = self.consecutive_exceptions.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    receiver = %self.name,
                    consecutive_exceptions = count,
                    error = %error,
                    "{description}"
                );
                let threshold = self.config.exception_warning_threshold;
                if count > threshold && !self.in_warning.swap(true, Ordering::AcqRel) {
                    warn!(
                        receiver = %self.name,
                        consecutive_exceptions = count,
                        threshold,
                        "Receiver keeps failing without receiving messages"
                    );
                    self.publish(MonitorEvent::ExceptionThresholdExceeded {
                        receiver: self.name.clone(),
                        consecutive_exceptions: count,
                        threshold,
                    })
                    .await;
                }
            }
            OnError::Recover => {
                error!(receiver = %self.name, error = %error, "{description}; receiver goes into ERROR");
                let from = self.run_state.get();
                if self
                    .run_state
                    .transition(&[RunState::Starting, RunState::Started], RunState::Error)
                {
                    self.publish_state_change(from, RunState::Error).await;
                    self.spawn_stop();
                }
            }
            OnError::Close => {
                error!(receiver = %self.name, error = %error, "{description}; receiver closes");
                self.spawn_stop();
            }
        }
    }

    fn spawn_stop(&self) {
        if let Some(receiver) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = receiver.stop().await {
                    error!(receiver = %receiver.name, error = %e, "Stop after exception failed");
                }
            });
        }
    }

    /// A message came in, so the transport works again
    pub(crate) fn reset_exception_counter(&self) {
        self.consecutive_exceptions.store(0, Ordering::Release);
        self.in_warning.store(false, Ordering::Release);
    }

    async fn set_run_state(&self, to: RunState) {
        let from = self.run_state.set(to);
        if from != to {
            debug!(receiver = %self.name, from = %from, to = %to, "Receiver state changed");
            self.publish_state_change(from, to).await;
        }
    }

    async fn publish_state_change(&self, from: RunState, to: RunState) {
        self.publish(MonitorEvent::ReceiverStateChanged {
            receiver: self.name.clone(),
            from,
            to,
        })
        .await;
    }

    pub(crate) async fn publish(&self, event: MonitorEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(receiver = %self.name, error = %e, "Failed to publish monitoring event");
        }
    }

    pub(crate) fn settings(&self) -> Result<Arc<ResolvedSettings<M>>> {
        self.settings.read().clone().ok_or_else(|| {
            ReceiverError::InvalidState(format!("receiver '{}' is not configured", self.name))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.settings.read().is_some()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    pub fn run_state_manager(&self) -> &RunStateManager {
        &self.run_state
    }

    pub fn is_transacted(&self) -> bool {
        self.config.is_transacted()
    }

    /// Whether the consecutive exception threshold has been crossed
    pub fn is_in_warning(&self) -> bool {
        self.in_warning.load(Ordering::Acquire)
    }

    pub fn consecutive_exceptions(&self) -> u32 {
        self.consecutive_exceptions.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.events
    }

    pub(crate) fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.transaction_manager
    }

    pub fn current_backoff_delay(&self) -> std::time::Duration {
        self.backoff.lock().current()
    }

    /// History of a message id, if it is still cached
    pub fn process_status(&self, message_id: &str) -> Option<ProcessStatusCacheItem> {
        self.cache.get(message_id)
    }

    /// Delivery count of a raw message: the listener's own count when it keeps
    /// one, otherwise one more than the cached count.
    pub fn get_delivery_count(&self, raw: &RawMessageWrapper<M>) -> i32 {
        if let Ok(settings) = self.settings() {
            if let Some(counter) = &settings.capabilities.delivery_count {
                return counter.get_delivery_count(raw);
            }
        }
        raw.id()
            .and_then(|id| self.cache.get(id))
            .map_or(1, |item| item.receive_count + 1)
    }

    /// Store holding messages in `state`: ERROR maps to the error storage,
    /// DONE to the message log
    pub fn message_browser(&self, state: ProcessState) -> Option<Arc<dyn MessageStore>> {
        match state {
            ProcessState::Error => self.error_storage.clone(),
            ProcessState::Done => self.message_log.clone(),
            ProcessState::Available | ProcessState::InProcess => None,
        }
    }

    /// Allow one more concurrent listen task
    pub async fn increase_thread_count(&self) {
        if let Some(container) = self.container.lock().await.as_ref() {
            container.increase_thread_count();
        }
    }

    /// Allow one concurrent listen task less, never going below one
    pub async fn decrease_thread_count(&self) -> Result<()> {
        match self.container.lock().await.as_ref() {
            Some(container) => container.decrease_thread_count(),
            None => Ok(()),
        }
    }

    pub async fn thread_count(&self) -> Option<usize> {
        self.container
            .lock()
            .await
            .as_ref()
            .map(|container| container.thread_count())
    }

    /// Whether the last poll found the source empty; `None` for pushing listeners
    pub async fn is_idle(&self) -> Option<bool> {
        self.container
            .lock()
            .await
            .as_ref()
            .map(|container| container.is_idle())
    }

    /// Wait applied after the next failed poll; `None` for pushing listeners
    pub async fn current_retry_interval(&self) -> Option<std::time::Duration> {
        self.container
            .lock()
            .await
            .as_ref()
            .map(|container| container.current_retry_interval())
    }
}

impl<M: RawPayload> std::fmt::Debug for Receiver<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("run_state", &self.run_state.get())
            .field("listener", &self.listener.name())
            .field("adapter", &self.adapter.name())
            .finish()
    }
}
