//! Receiver fixtures wired to mocks and in-memory infrastructure.

use super::mocks::{ListenerTraits, MockAdapter, MockQueueListener, RecordingSender};
use frank_core::config::ReceiverConfig;
use frank_core::message::RawMessageWrapper;
use frank_core::receiver::{Receiver, ReceiverBuilder};
use frank_core::storage::InMemoryMessageStore;
use frank_core::transaction::{
    DefaultTransactionManager, InMemoryTransactionBackend, Propagation, TransactionDefinition,
    TransactionHandle, TransactionManager,
};
use std::sync::Arc;
use std::time::Duration;

pub type TestTransactionManager = DefaultTransactionManager<InMemoryTransactionBackend>;

/// Receiver with all of its collaborators exposed for assertions
pub struct TestReceiver {
    pub receiver: Arc<Receiver<String>>,
    pub listener: Arc<MockQueueListener>,
    pub adapter: Arc<MockAdapter>,
    pub error_storage: Arc<InMemoryMessageStore>,
    pub message_log: Arc<InMemoryMessageStore>,
    pub sender: Arc<RecordingSender>,
    pub transaction_manager: Arc<TestTransactionManager>,
}

/// Base configuration for tests: one thread, one second poll interval
pub fn test_config(name: &str) -> ReceiverConfig {
    ReceiverConfig {
        poll_interval_secs: 1,
        max_retry_interval_secs: 8,
        ..ReceiverConfig::named(name)
    }
}

pub fn transacted_config(name: &str) -> ReceiverConfig {
    ReceiverConfig {
        transaction_attribute: Propagation::Required,
        ..test_config(name)
    }
}

pub struct TestReceiverBuilder {
    config: ReceiverConfig,
    traits: ListenerTraits,
    with_message_log: bool,
    with_sender: bool,
}

impl TestReceiverBuilder {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            traits: ListenerTraits::default(),
            with_message_log: false,
            with_sender: false,
        }
    }

    pub fn listener_traits(mut self, traits: ListenerTraits) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_message_log(mut self) -> Self {
        self.with_message_log = true;
        self
    }

    pub fn with_sender(mut self) -> Self {
        self.with_sender = true;
        self
    }

    /// Build without configuring
    pub fn build(self) -> TestReceiver {
        let listener = Arc::new(MockQueueListener::with_traits(
            &format!("{}-listener", self.config.name),
            self.traits,
        ));
        let adapter = Arc::new(MockAdapter::new(&format!("{}-adapter", self.config.name)));
        let error_storage = Arc::new(InMemoryMessageStore::new("errors"));
        let message_log = Arc::new(InMemoryMessageStore::new("message-log"));
        let sender = Arc::new(RecordingSender::default());
        let transaction_manager = Arc::new(TestTransactionManager::in_memory());

        let mut builder = ReceiverBuilder::new(
            self.config,
            adapter.clone(),
            transaction_manager.clone(),
        )
        .pulling_listener(listener.clone())
        .error_storage(error_storage.clone());
        if self.with_message_log {
            builder = builder.message_log(message_log.clone());
        }
        if self.with_sender {
            builder = builder.sender(sender.clone());
        }

        TestReceiver {
            receiver: builder.build().expect("receiver should build"),
            listener,
            adapter,
            error_storage,
            message_log,
            sender,
            transaction_manager,
        }
    }

    pub async fn configured(self) -> TestReceiver {
        let fixture = self.build();
        fixture
            .receiver
            .configure()
            .await
            .expect("receiver should configure");
        fixture
    }
}

impl TestReceiver {
    pub fn raw(id: &str, payload: &str) -> RawMessageWrapper<String> {
        RawMessageWrapper::new(payload.to_string(), Some(id.to_string()), None)
    }

    /// Transaction as the poll loop would open it for this receiver
    pub async fn begin(&self) -> TransactionHandle {
        let definition = TransactionDefinition::new(
            self.receiver.config().transaction_attribute,
            None,
        );
        self.transaction_manager
            .get_transaction(&definition, None)
            .await
            .expect("transaction should begin")
    }

    /// Commit, or roll back when the receiver marked the transaction rollback-only
    pub async fn finish(&self, tx: &TransactionHandle) {
        if tx.is_rollback_only() {
            self.transaction_manager.rollback(tx).await.expect("rollback");
        } else {
            self.transaction_manager.commit(tx).await.expect("commit");
        }
    }
}

/// Poll `condition` in small steps until it holds or `timeout` of (virtual) time passed
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
