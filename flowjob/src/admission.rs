use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::telemetry;

/// Counting gate bounding how many jobs one server process has in flight
/// against the worker pool.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Wait up to `timeout` for a permit. `false` means nothing was taken.
    async fn acquire(&self, timeout: Duration) -> bool;

    /// Return a permit. A release with no matching acquire is logged and
    /// ignored.
    fn release(&self);

    /// Permits currently free.
    fn available(&self) -> usize;

    /// Permits the gate was created with.
    fn capacity(&self) -> usize;
}

/// Permit held for the lifetime of the guard.
///
/// Obtained through [`admit`]; dropping it releases the permit on every
/// exit path, including unwinding and task cancellation.
#[must_use = "dropping the permit releases it immediately"]
pub struct AdmissionPermit<'a, A: Admission + ?Sized> {
    admission: &'a A,
}

impl<A: Admission + ?Sized> Drop for AdmissionPermit<'_, A> {
    fn drop(&mut self) {
        self.admission.release();
    }
}

impl<A: Admission + ?Sized> std::fmt::Debug for AdmissionPermit<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

/// Acquire a permit wrapped in a guard, or `None` on timeout.
pub async fn admit<A: Admission + ?Sized>(
    admission: &A,
    timeout: Duration,
) -> Option<AdmissionPermit<'_, A>> {
    let started = Instant::now();
    let granted = admission.acquire(timeout).await;
    telemetry::record_admission(granted, started.elapsed());
    granted.then_some(AdmissionPermit { admission })
}

/// [`Admission`] backed by a tokio semaphore.
///
/// Permits are detached from the semaphore on acquire and tracked in a
/// separate counter, so [`release`](Admission::release) can refuse to
/// return more permits than were handed out.
pub struct SemaphoreAdmission {
    semaphore: Semaphore,
    capacity: usize,
    held: AtomicUsize,
}

impl std::fmt::Debug for SemaphoreAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreAdmission")
            .field("capacity", &self.capacity)
            .field("held", &self.held.load(Ordering::Relaxed))
            .finish()
    }
}

impl SemaphoreAdmission {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            held: AtomicUsize::new(0),
        }
    }

    /// Permits currently handed out.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Admission for SemaphoreAdmission {
    async fn acquire(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
                telemetry::record_permits_held(held);
                true
            }
            Ok(Err(_closed)) => false,
            Err(_elapsed) => {
                tracing::debug!(timeout_ms = timeout.as_millis() as u64, "admission timed out");
                false
            }
        }
    }

    fn release(&self) {
        match self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1))
        {
            Ok(previous) => {
                self.semaphore.add_permits(1);
                telemetry::record_permits_held(previous - 1);
            }
            Err(_) => {
                tracing::warn!(
                    capacity = self.capacity,
                    "admission release without a matching acquire ignored"
                );
            }
        }
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_until_capacity_then_time_out() {
        let admission = SemaphoreAdmission::new(2);
        assert!(admission.acquire(Duration::from_millis(10)).await);
        assert!(admission.acquire(Duration::from_millis(10)).await);
        assert_eq!(admission.available(), 0);

        assert!(!admission.acquire(Duration::from_millis(10)).await);
        assert_eq!(admission.held(), 2);

        admission.release();
        assert!(admission.acquire(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_over_release_never_exceeds_capacity() {
        let admission = SemaphoreAdmission::new(1);
        admission.release();
        admission.release();
        assert_eq!(admission.available(), 1);
        assert_eq!(admission.held(), 0);

        assert!(admission.acquire(Duration::from_millis(10)).await);
        admission.release();
        admission.release();
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_permit_guard_releases_on_drop() {
        let admission = SemaphoreAdmission::new(1);
        {
            let _permit = admit(&admission, Duration::from_millis(10)).await.unwrap();
            assert_eq!(admission.available(), 0);
            assert!(admit(&admission, Duration::from_millis(10)).await.is_none());
        }
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let admission = Arc::new(SemaphoreAdmission::new(1));
        assert!(admission.acquire(Duration::from_millis(10)).await);

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        admission.release();

        assert!(waiter.await.unwrap());
        assert_eq!(admission.held(), 1);
    }

    #[tokio::test]
    async fn test_works_through_trait_object() {
        let admission: Arc<dyn Admission> = Arc::new(SemaphoreAdmission::new(3));
        let permit = admit(admission.as_ref(), Duration::from_millis(10)).await;
        assert!(permit.is_some());
        assert_eq!(admission.available(), 2);
        assert_eq!(admission.capacity(), 3);
    }
}
