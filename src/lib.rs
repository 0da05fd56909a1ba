#![allow(clippy::doc_markdown)] // Allow technical terms like JSON, YAML in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Frank Core Rust
//!
//! Message receivers for an integration framework: the component that takes
//! messages from an inbound channel, runs them through a pipeline and decides
//! what happens when that fails.
//!
//! ## Overview
//!
//! A [`Receiver`](receiver::Receiver) couples one listener to one adapter.
//! Pulling listeners (queues, tables, mailboxes) are polled by a
//! [`PullingListenerContainer`](pulling::PullingListenerContainer); pushing
//! listeners call back into the receiver. Either way every message passes the
//! same steps:
//!
//! 1. History check: delivery count against the retry limit
//! 2. Duplicate check against the message log
//! 3. Pipeline call inside the configured transaction
//! 4. Post-processing: process states, error storage, result cache
//! 5. Exponential backoff after failures
//!
//! ## Module Organization
//!
//! - [`receiver`] - Receiver lifecycle and per-message processing
//! - [`pulling`] - Poll loop for pulling listeners
//! - [`listener`] - Listener contracts and the in-process listener
//! - [`registry`] - Explicit registry of in-process listeners
//! - [`message`] - Message wrappers, sessions, compaction and masking
//! - [`transaction`] - Explicit transaction handles with propagation
//! - [`storage`] - Error storage and message log contracts
//! - [`concurrency`] - Reducible resource limiter
//! - [`state_machine`] - Run, process and exit states
//! - [`config`] - YAML configuration with environment overrides
//! - [`events`] - Monitoring events
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use frank_core::receiver::ReceiverBuilder;
//! use frank_core::transaction::DefaultTransactionManager;
//!
//! let receiver = ReceiverBuilder::new(config, adapter, Arc::new(DefaultTransactionManager::in_memory()))
//!     .pulling_listener(listener)
//!     .error_storage(Arc::new(InMemoryMessageStore::new("errors")))
//!     .build()?;
//! receiver.configure().await?;
//! receiver.start().await?;
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod adapter;
pub mod concurrency;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod listener;
pub mod logging;
pub mod message;
pub mod pulling;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod state_machine;
pub mod storage;
pub mod transaction;

pub use adapter::{Adapter, PipeLineResult};
pub use concurrency::{ResourceLimiter, ResourceToken};
pub use config::{ConfigManager, FrankConfig, OnError, ReceiverConfig};
pub use error::{ListenerError, PipelineError, ReceiverError, Result};
pub use events::{EventPublisher, MonitorEvent};
pub use listener::{
    HasProcessState, InProcessListener, KnowsDeliveryCount, Listener, MessageHandler,
    PeekableListener, PullingListener, PushingListener,
};
pub use message::{Message, MessageWrapper, PipeLineSession, RawMessageWrapper, ReceivedMessage};
pub use pulling::PullingListenerContainer;
pub use receiver::{ProcessOutcome, Receiver, ReceiverBuilder};
pub use registry::ListenerRegistry;
pub use state_machine::{ExitState, ProcessState, RunState};
pub use storage::{InMemoryMessageStore, MessageStore};
pub use transaction::{
    DefaultTransactionManager, Propagation, TransactionDefinition, TransactionHandle,
    TransactionManager,
};
