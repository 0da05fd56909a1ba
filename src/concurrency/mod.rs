//! Admission control for polling and processing tasks.

pub mod resource_limiter;

pub use resource_limiter::{LimiterError, ResourceLimiter, ResourceToken};
