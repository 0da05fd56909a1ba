use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::states::RunState;

/// Thread-safe holder of a receiver's run state.
///
/// Every transition goes through this manager. Waiters (idle sleeps, backoff
/// waits, the poll controller) subscribe to be woken on a state change.
#[derive(Debug, Clone)]
pub struct RunStateManager {
    sender: watch::Sender<RunState>,
}

impl Default for RunStateManager {
    fn default() -> Self {
        Self::new(RunState::Stopped)
    }
}

impl RunStateManager {
    pub fn new(initial: RunState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn get(&self) -> RunState {
        *self.sender.borrow()
    }

    /// Set the state, returning the previous one. Waiters are only notified
    /// when the value actually changes.
    pub fn set(&self, state: RunState) -> RunState {
        let mut previous = state;
        self.sender.send_if_modified(|current| {
            previous = *current;
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        previous
    }

    /// Transition only when the current state is one of `from`
    pub fn transition(&self, from: &[RunState], to: RunState) -> bool {
        let mut applied = false;
        self.sender.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                applied = true;
            }
            applied
        });
        applied
    }

    pub fn is_in_state(&self, state: RunState) -> bool {
        self.get() == state
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.sender.subscribe()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(RunState) -> bool) -> RunState {
        let mut receiver = self.subscribe();
        let current = *receiver.borrow_and_update();
        if predicate(current) {
            return current;
        }
        let state = match receiver.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            // the sender lives in self, so the channel cannot close while we wait
            Err(_) => self.get(),
        };
        state
    }

    /// Sleep until `duration` from now has passed, re-checking the state at
    /// least every `tick` and returning early once it is no longer `while_in`.
    /// Returns whether the full duration elapsed.
    pub async fn sleep_while_in(&self, while_in: RunState, duration: Duration, tick: Duration) -> bool {
        let mut receiver = self.subscribe();
        let deadline = Instant::now() + duration;
        loop {
            if *receiver.borrow_and_update() != while_in {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake = (now + tick).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        let current = *receiver.borrow();
        current == while_in
    }
}
