//! # Resource Limiter
//!
//! Counting semaphore with a ceiling that can be raised or lowered at runtime.
//!
//! Tokio's semaphore can add permits but not remove them, so lowering the
//! ceiling takes whatever permits are free right now and records the rest as
//! debt. Releases pay off the debt before they hand a permit back, which
//! means holders are never preempted and the reduction only ever affects
//! future acquisitions.
//!
//! Invariant: `available + held == max_resource_limit + debt`.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Resource limiter is closed")]
    Closed,
}

#[derive(Debug)]
struct LimiterState {
    max_resource_limit: usize,
    debt: usize,
}

#[derive(Debug)]
struct LimiterInner {
    semaphore: Semaphore,
    state: Mutex<LimiterState>,
}

/// Reducible counting semaphore; clones share the same permits
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    inner: Arc<LimiterInner>,
}

impl ResourceLimiter {
    pub fn new(max_resource_limit: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                semaphore: Semaphore::new(max_resource_limit),
                state: Mutex::new(LimiterState {
                    max_resource_limit,
                    debt: 0,
                }),
            }),
        }
    }

    /// Wait for a permit. The permit stays taken until [`release`](Self::release).
    ///
    /// Cancel-safe: dropping the future before it completes takes nothing.
    pub async fn acquire(&self) -> Result<(), LimiterError> {
        self.inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| LimiterError::Closed)?
            .forget();
        Ok(())
    }

    /// Wait for a permit that is released when the token is dropped
    pub async fn acquire_owned(&self) -> Result<ResourceToken, LimiterError> {
        self.acquire().await?;
        Ok(ResourceToken {
            limiter: Some(self.clone()),
        })
    }

    /// Take a permit if one is free right now
    pub fn try_acquire(&self) -> Option<ResourceToken> {
        let permit = self.inner.semaphore.try_acquire().ok()?;
        permit.forget();
        Some(ResourceToken {
            limiter: Some(self.clone()),
        })
    }

    /// Return a permit
    pub fn release(&self) {
        self.release_many(1);
    }

    fn release_many(&self, count: usize) {
        let mut state = self.inner.state.lock();
        let paid = count.min(state.debt);
        state.debt -= paid;
        if count > paid {
            self.inner.semaphore.add_permits(count - paid);
        }
    }

    /// Raise the ceiling by `n`; the new permits are available immediately
    pub fn increase_max_resource_count(&self, n: i64) -> Result<(), LimiterError> {
        let n = Self::check_count(n)?;
        let mut state = self.inner.state.lock();
        state.max_resource_limit += n;
        let offset = n.min(state.debt);
        state.debt -= offset;
        if n > offset {
            self.inner.semaphore.add_permits(n - offset);
        }
        Ok(())
    }

    /// Lower the ceiling by `n` without waiting for or preempting holders
    pub fn reduce_max_resource_count(&self, n: i64) -> Result<(), LimiterError> {
        let n = Self::check_count(n)?;
        let mut state = self.inner.state.lock();
        if n > state.max_resource_limit {
            return Err(LimiterError::InvalidArgument(format!(
                "cannot reduce limit {} by {n}",
                state.max_resource_limit
            )));
        }
        state.max_resource_limit -= n;

        let mut taken = 0;
        while taken < n {
            match self.inner.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    taken += 1;
                }
                Err(_) => break,
            }
        }
        state.debt += n - taken;
        Ok(())
    }

    /// Barrier: wait until no permit is held, without keeping any capacity.
    pub async fn wait_until_all_resources_available(&self) -> Result<(), LimiterError> {
        let limit = self.max_resource_limit();
        let count = u32::try_from(limit)
            .map_err(|_| LimiterError::InvalidArgument(format!("limit {limit} too large")))?;
        if count == 0 {
            return Ok(());
        }
        self.inner
            .semaphore
            .acquire_many(count)
            .await
            .map_err(|_| LimiterError::Closed)?
            .forget();
        self.release_many(limit);
        Ok(())
    }

    pub fn max_resource_limit(&self) -> usize {
        self.inner.state.lock().max_resource_limit
    }

    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    fn check_count(n: i64) -> Result<usize, LimiterError> {
        usize::try_from(n).map_err(|_| {
            LimiterError::InvalidArgument(format!("resource count must be non-negative, got {n}"))
        })
    }
}

/// Permit released back to its limiter on drop
#[derive(Debug)]
#[must_use = "the permit is released as soon as the token is dropped"]
pub struct ResourceToken {
    limiter: Option<ResourceLimiter>,
}

impl ResourceToken {
    /// Hand the permit back now
    pub fn release(mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}
