use crate::config::ConfigError;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
#[error("concurrency limiter closed")]
pub struct LimiterClosed;

impl From<AcquireError> for LimiterClosed {
    fn from(_: AcquireError) -> Self {
        LimiterClosed
    }
}

/// Counting admission gate capping in-flight requests.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// A held slot; dropping it returns the slot, whatever the request outcome.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(max_workers: usize) -> Result<Self, ConfigError> {
        let capacity = u32::try_from(max_workers)
            .ok()
            .filter(|&c| c >= 1)
            .ok_or(ConfigError::InvalidWorkers(max_workers))?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<SlotPermit, LimiterClosed> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(SlotPermit { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<SlotPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotPermit { _permit: permit })
    }

    /// Block until every outstanding slot has been returned.
    ///
    /// Takes the full capacity once and hands it straight back, so the
    /// limiter stays usable afterwards.
    pub async fn drain(&self) -> Result<(), LimiterClosed> {
        let all = self.semaphore.acquire_many(self.capacity).await?;
        drop(all);
        Ok(())
    }
}
