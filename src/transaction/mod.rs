//! # Transactions
//!
//! Explicit transaction handles with REQUIRED / REQUIRES_NEW / SUPPORTS style
//! propagation. A handle is threaded through every call that takes part in a
//! transaction; nothing is bound to the current task implicitly.
//!
//! A handle either owns a *physical* transaction (`is_new_transaction()`),
//! participates in one started by a caller, or is non-transactional. Only the
//! owner of a physical transaction commits or rolls it back; a participant that
//! rolls back marks the shared transaction rollback-only instead.

pub mod manager;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

pub use manager::{DefaultTransactionManager, InMemoryTransactionBackend, TransactionBackend};

/// Transaction propagation behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the current transaction, or start one
    Required,
    /// Join the current transaction, or run without one
    #[default]
    Supports,
    /// Join the current transaction, failing when there is none
    Mandatory,
    /// Always start an independent transaction
    RequiresNew,
    /// Run without a transaction, even when one is active
    NotSupported,
    /// Fail when a transaction is active
    Never,
}

impl Propagation {
    /// Whether work under this propagation always runs inside a transaction
    pub fn is_transacted(&self) -> bool {
        matches!(self, Self::Required | Self::RequiresNew | Self::Mandatory)
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::Supports => write!(f, "supports"),
            Self::Mandatory => write!(f, "mandatory"),
            Self::RequiresNew => write!(f, "requires_new"),
            Self::NotSupported => write!(f, "not_supported"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Requested propagation and timeout for a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub timeout: Option<Duration>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation, timeout: Option<Duration>) -> Self {
        Self {
            propagation,
            timeout,
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required, None)
    }

    /// Independent transaction, used for bookkeeping that must survive a rollback of the caller
    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew, None)
    }

    pub fn supports() -> Self {
        Self::new(Propagation::Supports, None)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a physical transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Callback run once the physical transaction completes
pub type Synchronization = Box<dyn FnOnce(TransactionOutcome) + Send>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    #[error("No existing transaction found for propagation 'mandatory'")]
    NoTransactionForMandatory,
    #[error("Existing transaction found for propagation 'never'")]
    ExistingTransactionForNever,
    #[error("Transaction {0} is already completed")]
    AlreadyCompleted(Uuid),
    #[error("Transaction {0} was rolled back because it was marked rollback-only")]
    UnexpectedRollback(Uuid),
    #[error("Transaction {id} timed out after {elapsed:?}")]
    TimedOut { id: Uuid, elapsed: Duration },
    #[error("Transaction backend error: {0}")]
    Backend(String),
}

/// State of a physical transaction shared by its owner and all participants
pub(crate) struct PhysicalTransaction {
    id: Uuid,
    started: Instant,
    timeout: Option<Duration>,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    synchronizations: Mutex<Vec<Synchronization>>,
}

impl PhysicalTransaction {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            timeout,
            rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn timed_out(&self) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        match self.timeout {
            Some(timeout) if elapsed > timeout => Some(elapsed),
            _ => None,
        }
    }

    /// Marks the transaction completed and runs the registered synchronizations in order
    pub(crate) fn complete(&self, outcome: TransactionOutcome) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let synchronizations = std::mem::take(&mut *self.synchronizations.lock());
        for synchronization in synchronizations {
            synchronization(outcome);
        }
    }
}

impl fmt::Debug for PhysicalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalTransaction")
            .field("id", &self.id)
            .field("rollback_only", &self.rollback_only.load(Ordering::Acquire))
            .field("completed", &self.completed.load(Ordering::Acquire))
            .finish()
    }
}

/// Scoped handle on a unit of work
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    physical: Option<Arc<PhysicalTransaction>>,
    new_transaction: bool,
    completed: Arc<AtomicBool>,
}

impl TransactionHandle {
    /// Handle for work that runs without a transaction
    pub fn non_transactional() -> Self {
        Self {
            physical: None,
            new_transaction: false,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn owning(physical: Arc<PhysicalTransaction>) -> Self {
        Self {
            physical: Some(physical),
            new_transaction: true,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn participating(outer: &TransactionHandle) -> Self {
        Self {
            physical: outer.physical.clone(),
            new_transaction: false,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn physical(&self) -> Option<&Arc<PhysicalTransaction>> {
        self.physical.as_ref()
    }

    /// Whether a physical transaction is open underneath this handle
    pub fn is_active(&self) -> bool {
        self.physical
            .as_ref()
            .is_some_and(|tx| !tx.completed.load(Ordering::Acquire))
    }

    /// Whether this handle started the physical transaction it refers to
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        self.physical.as_ref().map(|tx| tx.id)
    }

    /// Mark the shared transaction so it can only roll back
    pub fn set_rollback_only(&self) {
        if let Some(tx) = &self.physical {
            tx.rollback_only.store(true, Ordering::Release);
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.physical
            .as_ref()
            .is_some_and(|tx| tx.rollback_only.load(Ordering::Acquire))
    }

    /// Whether commit or rollback has been called on this handle
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    /// Register a callback for the end of the physical transaction.
    ///
    /// Returns `false` when no transaction is active; the callback is dropped
    /// in that case and callers apply their work immediately instead.
    pub fn register_synchronization(&self, synchronization: Synchronization) -> bool {
        match &self.physical {
            Some(tx) if !tx.completed.load(Ordering::Acquire) => {
                tx.synchronizations.lock().push(synchronization);
                true
            }
            _ => false,
        }
    }
}

/// Begin, commit and roll back units of work with propagation semantics
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    /// Obtain a handle for `definition`, joining `current` where the propagation allows
    async fn get_transaction(
        &self,
        definition: &TransactionDefinition,
        current: Option<&TransactionHandle>,
    ) -> Result<TransactionHandle, TransactionError>;

    /// Commit the handle; only a new transaction is physically committed
    async fn commit(&self, handle: &TransactionHandle) -> Result<(), TransactionError>;

    /// Roll back the handle; a participant only marks the shared transaction rollback-only
    async fn rollback(&self, handle: &TransactionHandle) -> Result<(), TransactionError>;
}
