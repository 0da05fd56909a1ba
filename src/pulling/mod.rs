//! # Pulling Listener Container
//!
//! Poll loop for pulling listeners: admission control through
//! [`ResourceLimiter`](crate::concurrency::ResourceLimiter)s, idle polling,
//! retrieval error backoff and the per-message transaction.

pub mod container;

pub use container::PullingListenerContainer;
