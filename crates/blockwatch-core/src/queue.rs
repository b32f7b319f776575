//! Capacity-bounded FIFO job queue.
//!
//! A capacity slot is taken when a job is admitted and travels with the job
//! through `dequeue` into its [`Release`] handle; the slot only returns to the
//! queue when the handle is released. Capacity therefore bounds the number of
//! jobs in flight, not just the number waiting.

use crate::error::{BlockwatchError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A queue feeding one job kind to its dispatcher.
#[async_trait]
pub trait JobQueue<T: Send + 'static>: Send + Sync + 'static {
    /// Admits `job`, suspending until capacity is available or `cancel` fires.
    async fn enqueue(&self, job: T, cancel: &CancellationToken) -> Result<()>;

    /// Suspends until a job is available or `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<T>>;
}

/// A dequeued job together with the handle that gives its capacity slot back.
pub struct Dequeued<T> {
    /// The job.
    pub job: T,
    /// Returns the capacity slot. Dropping it has the same effect as
    /// [`Release::release`].
    pub release: Release,
}

type TerminalHook = Box<dyn FnOnce() + Send + 'static>;

/// Capacity slot of one dequeued job.
///
/// Consumed by value, so a slot can be handed back at most once; if the
/// processor unwinds without calling either method the slot is returned on drop.
pub struct Release {
    permit: Option<OwnedSemaphorePermit>,
    on_terminal: Option<TerminalHook>,
}

impl Release {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            on_terminal: None,
        }
    }

    pub(crate) fn with_terminal_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_terminal = Some(Box::new(hook));
        self
    }

    /// Returns the capacity slot. The job may be resumed later.
    pub fn release(mut self) {
        self.permit.take();
    }

    /// Returns the capacity slot after the job reached a terminal state,
    /// running the queue's terminal cleanup first.
    pub fn release_terminal(mut self) {
        if let Some(hook) = self.on_terminal.take() {
            hook();
        }
        self.permit.take();
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if self.permit.is_some() {
            trace!("release handle dropped, returning capacity slot");
        }
    }
}

struct Slot<T> {
    job: T,
    permit: OwnedSemaphorePermit,
}

/// FIFO queue admitting at most `capacity` jobs between enqueue and release.
pub struct BoundedJobQueue<T> {
    items: Mutex<VecDeque<Slot<T>>>,
    queued: Semaphore,
    capacity: Arc<Semaphore>,
    total_capacity: AtomicUsize,
}

impl<T: Send + 'static> BoundedJobQueue<T> {
    /// Creates a queue with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BlockwatchError::invalid_config(
                "queue capacity must be positive",
            ));
        }
        Ok(Self {
            items: Mutex::new(VecDeque::new()),
            queued: Semaphore::new(0),
            capacity: Arc::new(Semaphore::new(capacity)),
            total_capacity: AtomicUsize::new(capacity),
        })
    }

    /// Suspends until a capacity slot is free, then admits `job`.
    pub async fn enqueue(&self, job: T, cancel: &CancellationToken) -> Result<()> {
        let permit = self.reserve(cancel).await?;
        self.push(job, permit);
        Ok(())
    }

    /// Takes a capacity slot without admitting anything yet.
    pub(crate) async fn reserve(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return Err(BlockwatchError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BlockwatchError::Cancelled),
            permit = self.capacity.clone().acquire_owned() => {
                permit.map_err(|_| BlockwatchError::Closed { what: "job queue" })
            }
        }
    }

    /// Admits `job` under an already reserved slot.
    pub(crate) fn push(&self, job: T, permit: OwnedSemaphorePermit) {
        self.items.lock().push_back(Slot { job, permit });
        self.queued.add_permits(1);
    }

    /// Suspends until a job is available, returning it with its release handle.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<T>> {
        if cancel.is_cancelled() {
            return Err(BlockwatchError::Cancelled);
        }
        let ticket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlockwatchError::Cancelled),
            ticket = self.queued.acquire() => {
                ticket.map_err(|_| BlockwatchError::Closed { what: "job queue" })?
            }
        };
        // One ticket is issued per pushed item, so the pop always succeeds.
        ticket.forget();
        let slot = self
            .items
            .lock()
            .pop_front()
            .ok_or(BlockwatchError::Closed { what: "job queue" })?;

        Ok(Dequeued {
            job: slot.job,
            release: Release::new(slot.permit),
        })
    }

    /// Jobs admitted but not yet dequeued.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no job is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots, including granted extras.
    pub fn capacity(&self) -> usize {
        self.total_capacity.load(Ordering::Acquire)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Jobs dequeued and not yet released.
    pub fn in_flight(&self) -> usize {
        self.capacity()
            .saturating_sub(self.available())
            .saturating_sub(self.len())
    }

    /// Adds `extra` capacity slots permanently.
    pub fn grant(&self, extra: usize) {
        self.total_capacity.fetch_add(extra, Ordering::AcqRel);
        self.capacity.add_permits(extra);
    }

    /// Fails every pending and future enqueue/dequeue.
    pub fn close(&self) {
        self.capacity.close();
        self.queued.close();
    }
}

#[async_trait]
impl<T: Send + 'static> JobQueue<T> for BoundedJobQueue<T> {
    async fn enqueue(&self, job: T, cancel: &CancellationToken) -> Result<()> {
        BoundedJobQueue::enqueue(self, job, cancel).await
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<T>> {
        BoundedJobQueue::dequeue(self, cancel).await
    }
}
