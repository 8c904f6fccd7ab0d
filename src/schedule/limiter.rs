use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("cancelled while waiting for a processing slot")]
    Cancelled,
    #[error("timed out waiting for a processing slot")]
    TimedOut,
    #[error("concurrency limiter is closed")]
    Closed,
}

/// Bounds how many tasks may run on the accelerator at once.
///
/// Waiters are admitted in arrival order (tokio's semaphore is fair).
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One processing slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Permit, AcquireError> {
        let acquire = self.semaphore.clone().acquire_owned();
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AcquireError::Cancelled),
            permit = acquire => permit
                .map(|permit| Permit { _permit: permit })
                .map_err(|_| AcquireError::Closed),
            _ = expired => Err(AcquireError::TimedOut),
        }
    }

    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
