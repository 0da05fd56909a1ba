//! Propagation-aware transaction manager over a pluggable backend.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    PhysicalTransaction, Propagation, TransactionDefinition, TransactionError, TransactionHandle,
    TransactionManager, TransactionOutcome,
};

/// Resource that performs the physical begin, commit and rollback
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    async fn begin(&self, transaction_id: Uuid) -> Result<(), TransactionError>;
    async fn commit(&self, transaction_id: Uuid) -> Result<(), TransactionError>;
    async fn rollback(&self, transaction_id: Uuid) -> Result<(), TransactionError>;
}

/// Backend without external resources; transactional work is carried by
/// synchronizations registered on the handles. Counts physical operations.
#[derive(Debug, Default)]
pub struct InMemoryTransactionBackend {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl InMemoryTransactionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransactionBackend for InMemoryTransactionBackend {
    async fn begin(&self, _transaction_id: Uuid) -> Result<(), TransactionError> {
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn commit(&self, _transaction_id: Uuid) -> Result<(), TransactionError> {
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(&self, _transaction_id: Uuid) -> Result<(), TransactionError> {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Transaction manager implementing the propagation rules on top of a backend
#[derive(Debug, Clone)]
pub struct DefaultTransactionManager<B: TransactionBackend> {
    backend: Arc<B>,
}

impl DefaultTransactionManager<InMemoryTransactionBackend> {
    /// Manager over an in-memory backend
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTransactionBackend::new()))
    }
}

impl<B: TransactionBackend> DefaultTransactionManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn begin_physical(
        &self,
        definition: &TransactionDefinition,
    ) -> Result<TransactionHandle, TransactionError> {
        let physical = Arc::new(PhysicalTransaction::new(definition.timeout));
        self.backend.begin(physical.id()).await?;
        debug!(
            transaction_id = %physical.id(),
            propagation = %definition.propagation,
            "Began new transaction"
        );
        Ok(TransactionHandle::owning(physical))
    }
}

#[async_trait]
impl<B: TransactionBackend + 'static> TransactionManager for DefaultTransactionManager<B> {
    async fn get_transaction(
        &self,
        definition: &TransactionDefinition,
        current: Option<&TransactionHandle>,
    ) -> Result<TransactionHandle, TransactionError> {
        let existing = current.filter(|handle| handle.is_active());

        match (definition.propagation, existing) {
            (Propagation::Required | Propagation::Supports | Propagation::Mandatory, Some(outer)) => {
                Ok(TransactionHandle::participating(outer))
            }
            (Propagation::RequiresNew, _) | (Propagation::Required, None) => {
                self.begin_physical(definition).await
            }
            (Propagation::Mandatory, None) => Err(TransactionError::NoTransactionForMandatory),
            (Propagation::Never, Some(_)) => Err(TransactionError::ExistingTransactionForNever),
            (Propagation::Supports | Propagation::NotSupported | Propagation::Never, None)
            | (Propagation::NotSupported, Some(_)) => Ok(TransactionHandle::non_transactional()),
        }
    }

    async fn commit(&self, handle: &TransactionHandle) -> Result<(), TransactionError> {
        let Some(physical) = handle.physical().cloned() else {
            handle.mark_completed();
            return Ok(());
        };
        if !handle.mark_completed() {
            return Err(TransactionError::AlreadyCompleted(physical.id()));
        }
        if !handle.is_new_transaction() {
            return Ok(());
        }

        if handle.is_rollback_only() {
            self.backend.rollback(physical.id()).await?;
            physical.complete(TransactionOutcome::RolledBack);
            return Err(TransactionError::UnexpectedRollback(physical.id()));
        }

        if let Some(elapsed) = physical.timed_out() {
            warn!(transaction_id = %physical.id(), elapsed_ms = elapsed.as_millis() as u64, "Transaction timed out, rolling back");
            self.backend.rollback(physical.id()).await?;
            physical.complete(TransactionOutcome::RolledBack);
            return Err(TransactionError::TimedOut {
                id: physical.id(),
                elapsed,
            });
        }

        match self.backend.commit(physical.id()).await {
            Ok(()) => {
                physical.complete(TransactionOutcome::Committed);
                debug!(transaction_id = %physical.id(), "Committed transaction");
                Ok(())
            }
            Err(e) => {
                physical.complete(TransactionOutcome::RolledBack);
                Err(e)
            }
        }
    }

    async fn rollback(&self, handle: &TransactionHandle) -> Result<(), TransactionError> {
        let Some(physical) = handle.physical().cloned() else {
            handle.mark_completed();
            return Ok(());
        };
        if !handle.mark_completed() {
            return Err(TransactionError::AlreadyCompleted(physical.id()));
        }
        if !handle.is_new_transaction() {
            handle.set_rollback_only();
            return Ok(());
        }

        let result = self.backend.rollback(physical.id()).await;
        physical.complete(TransactionOutcome::RolledBack);
        debug!(transaction_id = %physical.id(), "Rolled back transaction");
        result
    }
}
