//! Permit pool: a counting semaphore capping concurrent driver requests.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{PhysicalError, Result};

/// Default number of permits when none is configured.
pub const DEFAULT_PARALLEL_OPERATIONS: usize = 128;

/// A bounded counting semaphore.
///
/// Each driver operation holds one permit for its full duration; dropping the
/// returned guard releases it.
#[derive(Debug, Clone)]
pub struct PermitPool {
    sem: Arc<Semaphore>,
    permits: usize,
}

impl PermitPool {
    /// Create a pool with `permits` slots; 0 selects the default.
    pub fn new(permits: usize) -> Self {
        let permits = if permits == 0 {
            DEFAULT_PARALLEL_OPERATIONS
        } else {
            permits
        };
        Self {
            sem: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Wait for a free permit.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        let permit = self.sem.acquire().await.map_err(|_| PhysicalError::Closed)?;
        ::metrics::gauge!("physical.permit_pool.in_use").set(self.current_permits() as f64);
        Ok(permit)
    }

    /// Take every permit at once, waiting for in-flight operations to drain.
    pub async fn acquire_all(&self) -> Result<SemaphorePermit<'_>> {
        self.sem
            .acquire_many(self.permits as u32)
            .await
            .map_err(|_| PhysicalError::Closed)
    }

    /// Number of permits currently held.
    pub fn current_permits(&self) -> usize {
        self.permits - self.sem.available_permits()
    }

    pub fn size(&self) -> usize {
        self.permits
    }

    /// Reject future acquisitions; used on backend close.
    pub fn close(&self) {
        self.sem.close();
    }
}

impl Default for PermitPool {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_OPERATIONS)
    }
}
