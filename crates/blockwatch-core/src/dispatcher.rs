//! Dispatcher loop: dequeues jobs and runs each on its own worker task.
//!
//! Workers are registered with a task tracker so shutdown can wait for them.

use crate::processor::JobProcessor;
use crate::queue::JobQueue;
use crate::types::JobState;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Counters kept by a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Jobs handed to a worker.
    pub dispatched: u64,
    /// Jobs that ended Completed.
    pub completed: u64,
    /// Jobs that ended Failed.
    pub failed: u64,
    /// Jobs parked as Pending for a later resume.
    pub paused: u64,
}

impl DispatchStats {
    fn record(&mut self, state: JobState) {
        match state {
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Pending | JobState::Running => self.paused += 1,
        }
    }
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    name: &'static str,
    dispatcher: JoinHandle<()>,
    workers: TaskTracker,
    stats: watch::Receiver<DispatchStats>,
}

impl DispatcherHandle {
    /// Snapshot of the counters.
    pub fn stats(&self) -> DispatchStats {
        self.stats.borrow().clone()
    }

    /// Workers still running.
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Waits for the dispatch loop to stop and then for its workers, the latter for
    /// at most `grace`. Returns whether every worker finished in time.
    ///
    /// The loop only stops once its shutdown token fires or its queue closes.
    pub async fn join(self, grace: Duration) -> bool {
        if let Err(e) = self.dispatcher.await {
            warn!(dispatcher = self.name, error = %e, "dispatch loop panicked");
        }
        self.workers.close();
        match tokio::time::timeout(grace, self.workers.wait()).await {
            Ok(()) => {
                info!(dispatcher = self.name, "all workers finished");
                true
            }
            Err(_) => {
                warn!(
                    dispatcher = self.name,
                    remaining = self.workers.len(),
                    "workers still running after grace period"
                );
                false
            }
        }
    }
}

/// Dispatch loop for jobs of kind `T`.
pub struct Dispatcher<T, Q: ?Sized, P: ?Sized> {
    name: &'static str,
    queue: Arc<Q>,
    processor: Arc<P>,
    _job: PhantomData<fn() -> T>,
}

impl<T, Q, P> Dispatcher<T, Q, P>
where
    T: Send + 'static,
    Q: JobQueue<T> + ?Sized,
    P: JobProcessor<T> + ?Sized,
{
    /// Creates a dispatcher named `name` (used in logs).
    pub fn new(name: &'static str, queue: Arc<Q>, processor: Arc<P>) -> Self {
        Self {
            name,
            queue,
            processor,
            _job: PhantomData,
        }
    }

    /// Spawns the loop. It stops when `shutdown` fires or the queue closes.
    pub fn start(self, shutdown: CancellationToken) -> DispatcherHandle {
        let (stats_tx, stats_rx) = watch::channel(DispatchStats::default());
        let workers = TaskTracker::new();
        let name = self.name;
        let dispatcher = tokio::spawn(self.run(shutdown, workers.clone(), Arc::new(stats_tx)));

        DispatcherHandle {
            name,
            dispatcher,
            workers,
            stats: stats_rx,
        }
    }

    async fn run(
        self,
        shutdown: CancellationToken,
        workers: TaskTracker,
        stats: Arc<watch::Sender<DispatchStats>>,
    ) {
        info!(dispatcher = self.name, "dispatcher started");
        loop {
            let item = match self.queue.dequeue(&shutdown).await {
                Ok(item) => item,
                Err(e) if e.is_cancelled() => {
                    debug!(dispatcher = self.name, "dispatcher stopping on shutdown");
                    break;
                }
                Err(e) => {
                    warn!(dispatcher = self.name, error = %e, "dispatcher stopping");
                    break;
                }
            };

            stats.send_modify(|s| s.dispatched += 1);
            let processor = self.processor.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            workers.spawn(async move {
                let state = processor.process(item.job, item.release, shutdown).await;
                stats.send_modify(|s| s.record(state));
            });
        }
        workers.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BoundedJobQueue, Release};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Sleeps, then ends the job in the state named by the item.
    struct SleepyProcessor {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl JobProcessor<(u32, JobState)> for SleepyProcessor {
        async fn process(
            &self,
            job: (u32, JobState),
            release: Release,
            shutdown: CancellationToken,
        ) -> JobState {
            self.seen.lock().push(job.0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = shutdown.cancelled() => {}
            }
            release.release();
            job.1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_in_fifo_order_and_counts() {
        let queue = Arc::new(BoundedJobQueue::new(4).unwrap());
        let processor = Arc::new(SleepyProcessor {
            seen: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        queue.enqueue((1, JobState::Completed), &cancel).await.unwrap();
        queue.enqueue((2, JobState::Failed), &cancel).await.unwrap();
        queue.enqueue((3, JobState::Completed), &cancel).await.unwrap();

        let handle = Dispatcher::<(u32, JobState), _, _>::new("test", queue.clone(), processor.clone())
            .start(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.in_flight(), 3);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*processor.seen.lock(), vec![1, 2, 3]);
        let stats = handle.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(queue.available(), 4);

        shutdown.cancel();
        assert!(handle.join(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_workers() {
        let queue = Arc::new(BoundedJobQueue::new(4).unwrap());
        let processor = Arc::new(SleepyProcessor {
            seen: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        queue
            .enqueue((1, JobState::Pending), &CancellationToken::new())
            .await
            .unwrap();

        let handle = Dispatcher::<(u32, JobState), _, _>::new("test", queue.clone(), processor)
            .start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.in_flight(), 1);

        shutdown.cancel();
        let stats = handle.stats.clone();
        assert!(handle.join(Duration::from_secs(1)).await);
        assert_eq!(stats.borrow().paused, 1);
        assert_eq!(queue.available(), 4);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_loop() {
        let queue = Arc::new(BoundedJobQueue::<(u32, JobState)>::new(1).unwrap());
        let processor = Arc::new(SleepyProcessor {
            seen: Mutex::new(Vec::new()),
        });
        let handle = Dispatcher::<(u32, JobState), _, _>::new("test", queue.clone(), processor)
            .start(CancellationToken::new());
        queue.close();
        assert!(handle.join(Duration::from_secs(1)).await);
    }
}
