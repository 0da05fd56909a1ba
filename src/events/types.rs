use serde::{Deserialize, Serialize};

use crate::constants::events;
use crate::state_machine::RunState;

/// Operational events published by receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Backoff grew beyond half the suspension threshold
    ReceiverSuspended {
        receiver: String,
        backoff_delay_secs: u64,
    },
    /// A message succeeded after a suspension
    ReceiverResumed { receiver: String },
    ReceiverStateChanged {
        receiver: String,
        from: RunState,
        to: RunState,
    },
    /// Too many consecutive exceptions without a received message
    ExceptionThresholdExceeded {
        receiver: String,
        consecutive_exceptions: u32,
        threshold: u32,
    },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiverSuspended { .. } => events::RECEIVER_SUSPENDED,
            Self::ReceiverResumed { .. } => events::RECEIVER_RESUMED,
            Self::ReceiverStateChanged { .. } => events::RECEIVER_STATE_CHANGED,
            Self::ExceptionThresholdExceeded { .. } => events::EXCEPTION_THRESHOLD_EXCEEDED,
        }
    }

    pub fn receiver(&self) -> &str {
        match self {
            Self::ReceiverSuspended { receiver, .. }
            | Self::ReceiverResumed { receiver }
            | Self::ReceiverStateChanged { receiver, .. }
            | Self::ExceptionThresholdExceeded { receiver, .. } => receiver,
        }
    }
}
