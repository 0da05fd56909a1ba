use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::concurrency::{ResourceLimiter, ResourceToken};
use crate::config::ReceiverConfig;
use crate::constants::receiver::{INITIAL_BACKOFF_DELAY, SLEEP_TICK};
use crate::error::{ReceiverError, Result};
use crate::listener::{PullingListener, RawPayload, ThreadContext};
use crate::log_listener;
use crate::message::{RawMessageWrapper, ReceivedMessage};
use crate::receiver::{Receiver, ResolvedSettings};
use crate::state_machine::{ProcessState, RunState, RunStateManager};
use crate::transaction::{TransactionDefinition, TransactionHandle};

/// Polls a pulling listener and hands each retrieved message to its receiver.
///
/// A controller task admits listen tasks while the receiver is STARTED. Each
/// listen task holds a processing token for its whole life and, when polling
/// is capped separately, a poll token until retrieval is done.
pub struct PullingListenerContainer<M: RawPayload> {
    shared: Arc<ContainerShared<M>>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

struct ContainerShared<M: RawPayload> {
    receiver: Arc<Receiver<M>>,
    listener: Arc<dyn PullingListener<M>>,
    settings: Arc<ResolvedSettings<M>>,
    process_limiter: ResourceLimiter,
    poll_limiter: Option<ResourceLimiter>,
    idle: AtomicBool,
    retry_interval: Mutex<Duration>,
    poll_interval: Duration,
    max_retry_interval: Duration,
    peek_untransacted: bool,
}

impl<M: RawPayload> PullingListenerContainer<M> {
    pub(crate) fn new(
        receiver: Arc<Receiver<M>>,
        listener: Arc<dyn PullingListener<M>>,
        config: &ReceiverConfig,
        settings: Arc<ResolvedSettings<M>>,
    ) -> Self {
        let poll_limiter = config
            .has_poll_limit()
            .then(|| ResourceLimiter::new(config.num_threads_polling));
        Self {
            shared: Arc::new(ContainerShared {
                receiver,
                listener,
                settings,
                process_limiter: ResourceLimiter::new(config.num_threads),
                poll_limiter,
                idle: AtomicBool::new(false),
                retry_interval: Mutex::new(INITIAL_BACKOFF_DELAY),
                poll_interval: config.poll_interval(),
                max_retry_interval: config.max_retry_interval(),
                peek_untransacted: config.peek_untransacted,
            }),
            controller: Mutex::new(None),
        }
    }

    /// Spawn the controller task
    pub fn start(&self) {
        let mut controller = self.controller.lock();
        if controller.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *controller = Some(tokio::spawn(shared.run_controller()));
    }

    /// Wait for the controller and every listen task to finish.
    ///
    /// The controller exits once the receiver leaves STARTED, so the run
    /// state has to be changed before this is awaited.
    pub async fn stop(&self) {
        let handle = self.controller.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(listener = %self.shared.listener.name(), error = %e, "Poll controller panicked");
            }
        }
    }

    /// Whether the last poll found the source empty
    pub fn is_idle(&self) -> bool {
        self.shared.idle.load(Ordering::Acquire)
    }

    pub fn current_retry_interval(&self) -> Duration {
        *self.shared.retry_interval.lock()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.process_limiter.max_resource_limit()
    }

    pub fn increase_thread_count(&self) {
        if let Err(e) = self.shared.process_limiter.increase_max_resource_count(1) {
            warn!(listener = %self.shared.listener.name(), error = %e, "Could not increase thread count");
            return;
        }
        log_listener!(info, "THREAD_COUNT_INCREASED", listener: self.shared.listener.name(), threads: self.thread_count());
    }

    /// Lower the number of concurrent listen tasks by one; running tasks finish undisturbed
    pub fn decrease_thread_count(&self) -> Result<()> {
        if self.thread_count() <= 1 {
            debug!(listener = %self.shared.listener.name(), "Thread count already at its minimum of one");
            return Ok(());
        }
        self.shared
            .process_limiter
            .reduce_max_resource_count(1)
            .map_err(|e| ReceiverError::InvalidArgument(e.to_string()))?;
        log_listener!(info, "THREAD_COUNT_DECREASED", listener: self.shared.listener.name(), threads: self.thread_count());
        Ok(())
    }
}

impl<M: RawPayload> ContainerShared<M> {
    fn run_state(&self) -> &RunStateManager {
        self.receiver.run_state_manager()
    }

    async fn run_controller(self: Arc<Self>) {
        log_listener!(
            info,
            "CONTROLLER_STARTED",
            listener: self.listener.name(),
            threads: self.process_limiter.max_resource_limit(),
            polling_threads: self.poll_limiter.as_ref().map(ResourceLimiter::max_resource_limit),
        );
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        while self.run_state().is_in_state(RunState::Started) {
            // a free processing slot comes first, so no poll token is held while
            // every listen task is still busy processing
            let Some(process_token) = self.acquire_while_started(&self.process_limiter).await else {
                break;
            };
            let poll_token = match &self.poll_limiter {
                Some(limiter) => match self.acquire_while_started(limiter).await {
                    Some(token) => Some(token),
                    None => break,
                },
                None => None,
            };

            if self.idle.load(Ordering::Acquire)
                && !self.poll_interval.is_zero()
                && !self
                    .run_state()
                    .sleep_while_in(RunState::Started, self.poll_interval, SLEEP_TICK)
                    .await
            {
                break;
            }

            tasks.retain(|task| !task.is_finished());
            let shared = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                shared.listen_task(poll_token, process_token).await;
            }));
        }

        debug!(listener = %self.listener.name(), tasks = tasks.len(), "Poll controller waiting for listen tasks");
        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                error!(listener = %self.listener.name(), error = %e, "Listen task panicked");
            }
        }
        log_listener!(info, "CONTROLLER_STOPPED", listener: self.listener.name(), state: self.run_state().get());
    }

    /// Wait for a token, giving up as soon as the receiver leaves STARTED
    async fn acquire_while_started(&self, limiter: &ResourceLimiter) -> Option<ResourceToken> {
        tokio::select! {
            token = limiter.acquire_owned() => match token {
                Ok(token) => Some(token),
                Err(e) => {
                    error!(listener = %self.listener.name(), error = %e, "Could not acquire a listen token");
                    None
                }
            },
            _ = self.run_state().wait_for(|state| state != RunState::Started) => None,
        }
    }

    async fn listen_task(&self, mut poll_token: Option<ResourceToken>, process_token: ResourceToken) {
        let mut context = match self.listener.open_thread().await {
            Ok(context) => context,
            Err(e) => {
                self.receiver
                    .exception_thrown("Could not open listener thread", &e)
                    .await;
                self.increase_retry_interval_and_wait().await;
                return;
            }
        };

        self.poll_and_process(&mut context, &mut poll_token).await;

        if let Err(e) = self.listener.close_thread(context).await {
            warn!(listener = %self.listener.name(), error = %e, "Could not close listener thread");
        }
        drop(process_token);
    }

    async fn poll_and_process(
        &self,
        context: &mut ThreadContext,
        poll_token: &mut Option<ResourceToken>,
    ) {
        let receiver = &self.receiver;
        let transaction_manager = receiver.transaction_manager();

        if self.peek_untransacted {
            if let Some(peekable) = &self.settings.capabilities.peekable {
                match peekable.has_raw_message_available().await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.idle.store(true, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        receiver.exception_thrown("Could not peek for messages", &e).await;
                        self.increase_retry_interval_and_wait().await;
                        return;
                    }
                }
            }
        }

        let definition = &self.settings.transaction_definition;
        let tx = match transaction_manager.get_transaction(definition, None).await {
            Ok(tx) => tx,
            Err(e) => {
                receiver
                    .exception_thrown("Could not start a transaction to retrieve a message", &e)
                    .await;
                self.increase_retry_interval_and_wait().await;
                return;
            }
        };

        let raw = match self.listener.get_raw_message(&tx, context).await {
            Ok(raw) => {
                self.reset_retry_interval();
                raw
            }
            Err(e) => {
                receiver.rollback_quietly(&tx).await;
                receiver
                    .exception_thrown("Error occurred while retrieving message", &e)
                    .await;
                self.increase_retry_interval_and_wait().await;
                return;
            }
        };

        if let Some(token) = poll_token.take() {
            token.release();
        }

        let Some(raw) = raw else {
            self.idle.store(true, Ordering::Release);
            if let Err(e) = transaction_manager.commit(&tx).await {
                warn!(listener = %self.listener.name(), error = %e, "Could not commit empty poll");
            }
            return;
        };
        self.idle.store(false, Ordering::Release);

        let Some((tx, in_process_set)) = self.mark_in_process(&raw, tx, definition).await else {
            return;
        };

        let committed = match receiver.process_raw_message(raw.clone(), &tx).await {
            Ok(_) if !tx.is_rollback_only() => match transaction_manager.commit(&tx).await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        listener = %self.listener.name(),
                        message_id = ?raw.id(),
                        error = %e,
                        "Could not commit processed message"
                    );
                    false
                }
            },
            Ok(_) => {
                receiver.rollback_quietly(&tx).await;
                false
            }
            Err(e) => {
                receiver.rollback_quietly(&tx).await;
                receiver
                    .exception_thrown("Exception while processing message", &e)
                    .await;
                false
            }
        };

        if in_process_set && !committed {
            self.revert_to_available(&raw).await;
        }
    }

    /// Move the message to IN_PROCESS in its own committed transaction and
    /// open a fresh one for processing. Returns `None` when the message could
    /// not be taken into processing.
    async fn mark_in_process(
        &self,
        raw: &RawMessageWrapper<M>,
        tx: TransactionHandle,
        definition: &TransactionDefinition,
    ) -> Option<(TransactionHandle, bool)> {
        let receiver = &self.receiver;
        let transaction_manager = receiver.transaction_manager();

        let listener = match &self.settings.capabilities.process_state {
            Some(listener)
                if self
                    .settings
                    .capabilities
                    .supports_process_state(ProcessState::InProcess) =>
            {
                listener
            }
            _ => return Some((tx, false)),
        };

        let received = ReceivedMessage::Raw(raw.clone());
        if let Err(e) = listener
            .change_process_state(&tx, &received, ProcessState::InProcess, "taken into processing")
            .await
        {
            receiver.rollback_quietly(&tx).await;
            receiver
                .exception_thrown("Could not move message to IN_PROCESS", &e)
                .await;
            return None;
        }
        if let Err(e) = transaction_manager.commit(&tx).await {
            receiver
                .exception_thrown("Could not commit move to IN_PROCESS", &e)
                .await;
            return None;
        }

        match transaction_manager.get_transaction(definition, None).await {
            Ok(tx) => Some((tx, true)),
            Err(e) => {
                receiver
                    .exception_thrown("Could not start a transaction to process message", &e)
                    .await;
                self.revert_to_available(raw).await;
                None
            }
        }
    }

    /// Put a message that was rolled back after IN_PROCESS back to AVAILABLE
    async fn revert_to_available(&self, raw: &RawMessageWrapper<M>) {
        let Some(listener) = &self.settings.capabilities.process_state else {
            return;
        };
        if !self
            .settings
            .capabilities
            .supports_process_state(ProcessState::Available)
        {
            return;
        }
        let transaction_manager = self.receiver.transaction_manager();
        let tx = match transaction_manager
            .get_transaction(&TransactionDefinition::requires_new(), None)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                error!(listener = %self.listener.name(), error = %e, "Could not start a transaction to revert message");
                return;
            }
        };

        let received = ReceivedMessage::Raw(raw.clone());
        match listener
            .change_process_state(&tx, &received, ProcessState::Available, "processing rolled back")
            .await
        {
            Ok(_) => {
                if let Err(e) = transaction_manager.commit(&tx).await {
                    error!(listener = %self.listener.name(), message_id = ?raw.id(), error = %e, "Could not commit revert to AVAILABLE");
                }
            }
            Err(e) => {
                error!(listener = %self.listener.name(), message_id = ?raw.id(), error = %e, "Could not revert message to AVAILABLE");
                self.receiver.rollback_quietly(&tx).await;
            }
        }
    }

    fn reset_retry_interval(&self) {
        *self.retry_interval.lock() = INITIAL_BACKOFF_DELAY;
    }

    /// Wait the retrieval retry interval and double it, up to the configured cap
    async fn increase_retry_interval_and_wait(&self) {
        let wait = {
            let mut interval = self.retry_interval.lock();
            let wait = *interval;
            *interval = (wait * 2).min(self.max_retry_interval);
            wait
        };
        log_listener!(warn, "RETRY_WAIT", listener: self.listener.name(), wait_secs: wait.as_secs());
        self.run_state()
            .sleep_while_in(RunState::Started, wait, SLEEP_TICK)
            .await;
    }
}
