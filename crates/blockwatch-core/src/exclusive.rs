//! Continuous-job queue admitting at most one active job per subject.

use crate::error::Result;
use crate::queue::{BoundedJobQueue, Dequeued, JobQueue};
use crate::types::ContinuousJob;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What [`ExclusiveContinuousQueue::enqueue`] did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job was registered and queued.
    Queued,
    /// A job for the subject is already queued or running; nothing changed.
    AlreadyActive,
    /// A terminate request cancelled the subject's active job.
    Terminated,
    /// A terminate request found no active job; nothing changed.
    NotActive,
}

#[derive(Debug)]
struct Registration {
    id: u64,
    token: CancellationToken,
}

type Registry = Arc<DashMap<String, Registration>>;

/// Bounded queue of [`ContinuousJob`]s with a per-subject cancellation registry.
///
/// A subject key is registered from the moment its job is admitted until the job
/// reaches a terminal state or is terminated. Parking a job as Pending at shutdown
/// leaves the entry alone; the registry does not outlive the process.
pub struct ExclusiveContinuousQueue {
    inner: BoundedJobQueue<(ContinuousJob, u64)>,
    active: Registry,
    next_registration: AtomicU64,
}

impl ExclusiveContinuousQueue {
    /// Creates a queue with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: BoundedJobQueue::new(capacity)?,
            active: Arc::new(DashMap::new()),
            next_registration: AtomicU64::new(1),
        })
    }

    /// Admits `job`, or handles it as a terminate request if `job.terminate` is set.
    ///
    /// Terminate requests and duplicates return without waiting. A new job waits for
    /// a capacity slot; the subject is reserved before the wait, so a concurrent
    /// enqueue for the same subject is a no-op.
    pub async fn enqueue(
        &self,
        mut job: ContinuousJob,
        cancel: &CancellationToken,
    ) -> Result<Admission> {
        let key = job.subject_key().to_owned();

        if job.terminate {
            return Ok(match self.active.remove(&key) {
                Some((_, registration)) => {
                    registration.token.cancel();
                    info!(subject = %key, "terminate requested for continuous job");
                    Admission::Terminated
                }
                None => {
                    debug!(subject = %key, "terminate for inactive subject ignored");
                    Admission::NotActive
                }
            });
        }

        let (registration_id, token) = match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(subject = %key, "continuous job already active");
                return Ok(Admission::AlreadyActive);
            }
            Entry::Vacant(slot) => {
                let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                slot.insert(Registration {
                    id,
                    token: token.clone(),
                });
                (id, token)
            }
        };

        let permit = match self.inner.reserve(cancel).await {
            Ok(permit) => permit,
            Err(e) => {
                unregister(&self.active, &key, registration_id);
                return Err(e);
            }
        };

        job.cancel = Some(token);
        self.inner.push((job, registration_id), permit);
        debug!(subject = %key, registration_id, "continuous job queued");
        Ok(Admission::Queued)
    }

    /// Dequeues the next job. Its terminal release also unregisters the subject.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<ContinuousJob>> {
        let Dequeued {
            job: (job, registration_id),
            release,
        } = self.inner.dequeue(cancel).await?;

        let active = self.active.clone();
        let key = job.subject_key().to_owned();
        let release =
            release.with_terminal_hook(move || unregister(&active, &key, registration_id));

        Ok(Dequeued { job, release })
    }

    /// Whether a job is registered for `key`.
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// Subject keys with a queued or running job.
    pub fn active_subjects(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Jobs admitted but not yet dequeued.
    pub fn queued_count(&self) -> usize {
        self.inner.len()
    }

    /// Free capacity slots.
    pub fn available_count(&self) -> usize {
        self.inner.available()
    }

    /// Jobs dequeued and not yet released.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight()
    }

    /// Grants one extra capacity slot.
    pub fn allow_one(&self) {
        self.inner.grant(1);
        info!(
            capacity = self.inner.capacity(),
            "granted one extra continuous slot"
        );
    }

    /// Fails every pending and future enqueue/dequeue.
    pub fn close(&self) {
        self.inner.close();
    }
}

fn unregister(active: &DashMap<String, Registration>, key: &str, registration_id: u64) {
    if active
        .remove_if(key, |_, registration| registration.id == registration_id)
        .is_some()
    {
        debug!(subject = %key, registration_id, "continuous job unregistered");
    }
}

#[async_trait]
impl JobQueue<ContinuousJob> for ExclusiveContinuousQueue {
    async fn enqueue(&self, job: ContinuousJob, cancel: &CancellationToken) -> Result<()> {
        ExclusiveContinuousQueue::enqueue(self, job, cancel)
            .await
            .map(|_| ())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<ContinuousJob>> {
        ExclusiveContinuousQueue::dequeue(self, cancel).await
    }
}
