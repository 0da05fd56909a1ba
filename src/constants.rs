//! # Receiver Constants
//!
//! Well-known keys, monitoring event names and the operational limits shared by
//! the receiver and the pulling listener container.

use std::time::Duration;

/// Keys under which message metadata is mirrored into message contexts and
/// pipeline sessions
pub mod context_keys {
    pub const MESSAGE_ID: &str = "message_id";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const TS_RECEIVED: &str = "ts_received";
    pub const MANUAL_RETRY: &str = "manual_retry";
    pub const EXIT_STATE: &str = "exit_state";
    pub const EXIT_CODE: &str = "exit_code";
    pub const DELIVERY_COUNT: &str = "delivery_count";
}

/// Monitoring event names published by receivers
pub mod events {
    pub const RECEIVER_SUSPENDED: &str = "receiver.suspended";
    pub const RECEIVER_RESUMED: &str = "receiver.resumed";
    pub const RECEIVER_STATE_CHANGED: &str = "receiver.state_changed";
    pub const EXCEPTION_THRESHOLD_EXCEEDED: &str = "receiver.exception_threshold_exceeded";
}

/// Receiver-wide limits and defaults
pub mod receiver {
    use super::Duration;

    /// Backoff delays beyond half of this threshold publish a suspension event
    pub const RCV_SUSPENSION_MESSAGE_THRESHOLD: Duration = Duration::from_secs(60);

    /// Granularity of every idle or backoff sleep, so stop requests are honoured quickly
    pub const SLEEP_TICK: Duration = Duration::from_secs(1);

    /// Initial backoff delay and the value it resets to after a success
    pub const INITIAL_BACKOFF_DELAY: Duration = Duration::from_secs(1);

    pub const DEFAULT_MAX_BACKOFF_DELAY_SECS: u64 = 60;
    pub const DEFAULT_MAX_RETRY_INTERVAL_SECS: u64 = 3600;
    pub const DEFAULT_MAX_RETRIES: i32 = 1;
    pub const DEFAULT_MAX_RETRIES_DELIVERY_COUNT_AWARE: i32 = 3;
    pub const DEFAULT_PROCESS_RESULT_CACHE_SIZE: usize = 100;
    pub const DEFAULT_EXCEPTION_WARNING_THRESHOLD: u32 = 5;

    /// Comment recorded for messages rejected by the retry limit
    pub const TOO_MANY_RETRIES_COMMENT: &str = "too many redeliveries or retries";

    /// Result handed back when the pipeline exceeds the transaction timeout
    pub const RESULT_ON_TIMEOUT: &str = "<timeout/>";

    /// Exit code recorded for duplicates that were skipped
    pub const EXIT_CODE_DUPLICATE: i32 = 304;

    /// Exit code recorded for messages rejected before processing
    pub const EXIT_CODE_REJECTED: i32 = 500;
}
