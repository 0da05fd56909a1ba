//! Mock listener, adapter and sender for receiver tests.

use async_trait::async_trait;
use frank_core::adapter::{Adapter, PipeLineResult};
use frank_core::error::{ListenerError, PipelineError};
use frank_core::listener::{
    HasProcessState, KnowsDeliveryCount, Listener, PeekableListener, PullingListener,
    ThreadContext,
};
use frank_core::message::{Message, PipeLineSession, RawMessageWrapper, ReceivedMessage};
use frank_core::sender::{ResultSender, SenderError};
use frank_core::state_machine::{ExitState, ProcessState, RunState};
use frank_core::transaction::{TransactionHandle, TransactionOutcome};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Payload the mock listener refuses to extract
pub const UNREADABLE: &str = "<unreadable/>";

/// Optional abilities of a [`MockQueueListener`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerTraits {
    pub counts_deliveries: bool,
    pub process_states: bool,
    pub peekable: bool,
    pub redelivers: bool,
}

/// Queue-backed pulling listener.
///
/// A message retrieved under an active transaction is put back at the head of
/// the queue when that transaction rolls back.
pub struct MockQueueListener {
    name: String,
    traits: ListenerTraits,
    queue: Arc<Mutex<VecDeque<RawMessageWrapper<String>>>>,
    deliveries: Arc<Mutex<HashMap<String, i32>>>,
    states: Arc<Mutex<HashMap<String, ProcessState>>>,
    processed: Mutex<Vec<(Option<String>, ExitState)>>,
    finished_sessions: Mutex<Vec<PipeLineSession>>,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub threads_opened: AtomicUsize,
    pub threads_closed: AtomicUsize,
    fail_open: AtomicBool,
    retrieval_failures: AtomicUsize,
    retrievals: Mutex<Vec<tokio::time::Instant>>,
}

impl MockQueueListener {
    pub fn new(name: &str) -> Self {
        Self::with_traits(name, ListenerTraits::default())
    }

    pub fn with_traits(name: &str, traits: ListenerTraits) -> Self {
        Self {
            name: name.to_string(),
            traits,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            deliveries: Arc::new(Mutex::new(HashMap::new())),
            states: Arc::new(Mutex::new(HashMap::new())),
            processed: Mutex::new(Vec::new()),
            finished_sessions: Mutex::new(Vec::new()),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            threads_opened: AtomicUsize::new(0),
            threads_closed: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            retrieval_failures: AtomicUsize::new(0),
            retrievals: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, id: &str, payload: &str) {
        let raw = RawMessageWrapper::new(payload.to_string(), Some(id.to_string()), None);
        self.states
            .lock()
            .insert(id.to_string(), ProcessState::Available);
        self.queue.lock().push_back(raw);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    /// Make the next `n` retrievals fail
    pub fn fail_retrievals(&self, n: usize) {
        self.retrieval_failures.store(n, Ordering::Release);
    }

    /// Session handed to `after_message_processed` for the latest message
    pub fn last_session(&self) -> Option<PipeLineSession> {
        self.finished_sessions.lock().last().cloned()
    }

    /// Times between consecutive `get_raw_message` calls
    pub fn retrieval_gaps(&self) -> Vec<Duration> {
        self.retrievals
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    /// Pretend the transport already delivered `id` this many times
    pub fn set_delivery_count(&self, id: &str, count: i32) {
        self.deliveries.lock().insert(id.to_string(), count);
    }

    pub fn process_state(&self, id: &str) -> Option<ProcessState> {
        self.states.lock().get(id).copied()
    }

    /// Exit states reported through `after_message_processed`, in order
    pub fn processed(&self) -> Vec<(Option<String>, ExitState)> {
        self.processed.lock().clone()
    }

    fn apply_on_commit(tx: &TransactionHandle, apply: impl FnOnce() + Send + 'static) {
        let apply = Arc::new(Mutex::new(Some(apply)));
        let deferred = apply.clone();
        let registered = tx.register_synchronization(Box::new(move |outcome| {
            if outcome == TransactionOutcome::Committed {
                if let Some(apply) = deferred.lock().take() {
                    apply();
                }
            }
        }));
        if !registered {
            if let Some(apply) = apply.lock().take() {
                apply();
            }
        }
    }
}

#[async_trait]
impl Listener<String> for MockQueueListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ListenerError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::Acquire) {
            return Err(ListenerError::OpenFailed {
                name: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn extract_message(&self, raw: &RawMessageWrapper<String>) -> Result<Message, ListenerError> {
        if raw.raw_message() == UNREADABLE {
            return Err(ListenerError::Extraction {
                message_id: raw.id().unwrap_or_default().to_string(),
                reason: "unreadable payload".to_string(),
            });
        }
        Ok(Message::from(raw.raw_message().clone()))
    }

    async fn after_message_processed(
        &self,
        result: &PipeLineResult,
        message: &ReceivedMessage<String>,
        session: &PipeLineSession,
    ) -> Result<(), ListenerError> {
        self.processed
            .lock()
            .push((message.id().map(str::to_string), result.state));
        self.finished_sessions.lock().push(session.clone());
        Ok(())
    }

    fn redelivers_on_failure(&self) -> bool {
        self.traits.redelivers
    }

    fn as_peekable(self: Arc<Self>) -> Option<Arc<dyn PeekableListener<String>>> {
        if self.traits.peekable {
            Some(self)
        } else {
            None
        }
    }

    fn as_process_state(self: Arc<Self>) -> Option<Arc<dyn HasProcessState<String>>> {
        if self.traits.process_states {
            Some(self)
        } else {
            None
        }
    }

    fn as_delivery_count(self: Arc<Self>) -> Option<Arc<dyn KnowsDeliveryCount<String>>> {
        if self.traits.counts_deliveries {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PullingListener<String> for MockQueueListener {
    async fn open_thread(&self) -> Result<ThreadContext, ListenerError> {
        self.threads_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadContext::new())
    }

    async fn close_thread(&self, _context: ThreadContext) -> Result<(), ListenerError> {
        self.threads_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_raw_message(
        &self,
        tx: &TransactionHandle,
        _context: &mut ThreadContext,
    ) -> Result<Option<RawMessageWrapper<String>>, ListenerError> {
        self.retrievals.lock().push(tokio::time::Instant::now());
        let pending_failures = self.retrieval_failures.load(Ordering::Acquire);
        if pending_failures > 0 {
            self.retrieval_failures
                .store(pending_failures - 1, Ordering::Release);
            return Err(ListenerError::Retrieval("broker unavailable".to_string()));
        }

        let Some(raw) = self.queue.lock().pop_front() else {
            return Ok(None);
        };
        if let Some(id) = raw.id() {
            *self.deliveries.lock().entry(id.to_string()).or_insert(0) += 1;
        }

        let queue = Arc::clone(&self.queue);
        let requeued = raw.clone();
        tx.register_synchronization(Box::new(move |outcome| {
            if outcome == TransactionOutcome::RolledBack {
                queue.lock().push_front(requeued);
            }
        }));
        Ok(Some(raw))
    }
}

#[async_trait]
impl PeekableListener<String> for MockQueueListener {
    async fn has_raw_message_available(&self) -> Result<bool, ListenerError> {
        Ok(!self.queue.lock().is_empty())
    }
}

#[async_trait]
impl HasProcessState<String> for MockQueueListener {
    fn known_process_states(&self) -> HashSet<ProcessState> {
        [
            ProcessState::Available,
            ProcessState::InProcess,
            ProcessState::Done,
            ProcessState::Error,
        ]
        .into_iter()
        .collect()
    }

    async fn change_process_state(
        &self,
        tx: &TransactionHandle,
        message: &ReceivedMessage<String>,
        to: ProcessState,
        _reason: &str,
    ) -> Result<bool, ListenerError> {
        let Some(id) = message.id().map(str::to_string) else {
            return Ok(false);
        };
        // like a table listener, an AVAILABLE message is offered again
        let requeue = match to {
            ProcessState::Available => message.as_raw().cloned(),
            _ => None,
        };
        let states = Arc::clone(&self.states);
        let queue = Arc::clone(&self.queue);
        Self::apply_on_commit(tx, move || {
            states.lock().insert(id, to);
            if let Some(raw) = requeue {
                queue.lock().push_front(raw);
            }
        });
        Ok(true)
    }
}

impl KnowsDeliveryCount<String> for MockQueueListener {
    fn get_delivery_count(&self, raw: &RawMessageWrapper<String>) -> i32 {
        raw.id()
            .and_then(|id| self.deliveries.lock().get(id).copied())
            .unwrap_or(1)
    }
}

/// One pipeline invocation seen by [`MockAdapter`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCall {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub payload: String,
    pub manual_retry: bool,
    pub delivery_count: Option<i64>,
}

/// Pipeline whose behaviour is chosen by the payload:
/// `fail` ends in error, `explode` raises, `slow` takes ten seconds,
/// anything else succeeds with `<ok>{payload}</ok>`.
pub struct MockAdapter {
    name: String,
    state: Mutex<RunState>,
    calls: Mutex<Vec<AdapterCall>>,
    healed: AtomicBool,
    remaining_failures: AtomicUsize,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(RunState::Started),
            calls: Mutex::new(Vec::new()),
            healed: AtomicBool::new(false),
            remaining_failures: AtomicUsize::new(0),
        }
    }

    pub fn set_run_state(&self, state: RunState) {
        *self.state.lock() = state;
    }

    /// From now on every payload succeeds
    pub fn heal(&self) {
        self.healed.store(true, Ordering::Release);
    }

    /// Fail the next `n` invocations whatever their payload
    pub fn fail_next(&self, n: usize) {
        self.remaining_failures.store(n, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_state(&self) -> RunState {
        *self.state.lock()
    }

    async fn process_message_with_exceptions(
        &self,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipelineError> {
        let payload = message.as_string().unwrap_or_default().into_owned();
        self.calls.lock().push(AdapterCall {
            message_id: message_id.to_string(),
            correlation_id: session.correlation_id().map(str::to_string),
            payload: payload.clone(),
            manual_retry: session.is_manual_retry(),
            delivery_count: session.delivery_count(),
        });

        let forced = self
            .remaining_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(PipeLineResult::error("<forced-failure/>"));
        }
        if self.healed.load(Ordering::Acquire) {
            return Ok(PipeLineResult::success(format!("<ok>{payload}</ok>")));
        }

        if payload.contains("explode") {
            return Err(PipelineError::ProcessingFailed {
                adapter: self.name.clone(),
                message_id: message_id.to_string(),
                reason: "pipe threw".to_string(),
            });
        }
        if payload.contains("slow") {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if payload.contains("fail") {
            return Ok(PipeLineResult::error(format!("<error>{payload}</error>")));
        }
        Ok(PipeLineResult::success(format!("<ok>{payload}</ok>")))
    }
}

/// Sender recording every result it is handed
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, PipeLineResult)>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<(String, PipeLineResult)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ResultSender for RecordingSender {
    fn name(&self) -> &str {
        "recording-sender"
    }

    async fn send_result(
        &self,
        message_id: &str,
        result: &PipeLineResult,
        _session: &PipeLineSession,
    ) -> Result<(), SenderError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(SenderError::SendFailed {
                sender: self.name().to_string(),
                message_id: message_id.to_string(),
                reason: "destination unreachable".to_string(),
            });
        }
        self.sent
            .lock()
            .push((message_id.to_string(), result.clone()));
        Ok(())
    }
}
