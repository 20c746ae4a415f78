use async_trait::async_trait;
use flowjob::{Admission, SemaphoreAdmission, TaskRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionEvent {
    Granted,
    TimedOut,
    Released,
}

/// [`SemaphoreAdmission`] that remembers every acquire and release.
#[derive(Clone)]
pub struct RecordingAdmission {
    inner: Arc<SemaphoreAdmission>,
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    probe: Option<Arc<TaskRegistry>>,
    observed: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingAdmission {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreAdmission::new(capacity)),
            events: Arc::new(Mutex::new(Vec::new())),
            probe: None,
            observed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot the statuses of every active task in `registry` each time a
    /// permit is requested.
    pub fn with_registry_probe(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.probe = Some(registry);
        self
    }

    /// One status list per acquire call, in call order.
    pub fn observed_statuses(&self) -> Vec<Vec<String>> {
        self.observed.lock().clone()
    }

    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: AdmissionEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    /// Permits currently handed out.
    pub fn held(&self) -> usize {
        self.inner.held()
    }
}

impl std::fmt::Debug for RecordingAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingAdmission")
            .field("inner", &self.inner)
            .field("events", &self.events.lock().len())
            .finish()
    }
}

#[async_trait]
impl Admission for RecordingAdmission {
    async fn acquire(&self, timeout: Duration) -> bool {
        if let Some(registry) = &self.probe {
            let statuses = registry.list_active().into_iter().map(|r| r.status).collect();
            self.observed.lock().push(statuses);
        }
        let granted = self.inner.acquire(timeout).await;
        self.events.lock().push(if granted {
            AdmissionEvent::Granted
        } else {
            AdmissionEvent::TimedOut
        });
        granted
    }

    fn release(&self) {
        self.events.lock().push(AdmissionEvent::Released);
        self.inner.release();
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
