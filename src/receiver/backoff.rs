use std::time::Duration;

use crate::constants::receiver::{INITIAL_BACKOFF_DELAY, RCV_SUSPENSION_MESSAGE_THRESHOLD};

/// Exponential backoff applied after failed messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    current: Duration,
    max: Duration,
    suspension_pending: bool,
}

/// One step of the backoff sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    /// How long to wait now
    pub delay: Duration,
    /// The suspension threshold was crossed for the first time since the last success
    pub suspended: bool,
}

impl BackoffState {
    pub fn new(max: Duration) -> Self {
        Self {
            current: INITIAL_BACKOFF_DELAY,
            max: max.max(INITIAL_BACKOFF_DELAY),
            suspension_pending: false,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_pending
    }

    /// Take the current delay and double it for the next failure, up to the cap
    pub fn next_step(&mut self) -> BackoffStep {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        let suspended = delay * 2 > RCV_SUSPENSION_MESSAGE_THRESHOLD && !self.suspension_pending;
        if suspended {
            self.suspension_pending = true;
        }
        BackoffStep { delay, suspended }
    }

    /// Back to the initial delay; returns whether a suspension was pending
    pub fn reset(&mut self) -> bool {
        self.current = INITIAL_BACKOFF_DELAY;
        std::mem::replace(&mut self.suspension_pending, false)
    }
}
