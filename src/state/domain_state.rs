use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Per-domain concurrency slots
///
/// Each domain gets its own semaphore with `per_domain` permits, created on
/// first use. Holding a permit is what allows a crawl of that domain to be
/// in flight; the permit is returned when dropped.
#[derive(Debug)]
pub struct DomainLimiter {
    per_domain: usize,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl DomainLimiter {
    /// # Arguments
    ///
    /// * `per_domain` - Maximum concurrent in-flight crawls per domain (at least 1)
    pub fn new(per_domain: usize) -> Self {
        Self {
            per_domain: per_domain.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain)))
            .clone()
    }

    /// Waits for a free slot on `domain`
    pub async fn acquire(&self, domain: &str) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore(domain).acquire_owned().await
    }

    /// Free slots on `domain` right now
    pub fn available(&self, domain: &str) -> usize {
        self.semaphore(domain).available_permits()
    }

    /// Number of domains seen so far
    pub fn domain_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}
