//! Re-admits persisted, unfinished continuous jobs at startup.

use crate::clock::Clock;
use crate::error::Result;
use crate::exclusive::{Admission, ExclusiveContinuousQueue};
use crate::rate_gate::{RateGate, RateLimit};
use crate::store::JobStore;
use crate::types::JobState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resumes Pending and Running continuous jobs, spread evenly over a window so a
/// restart does not burst the remote API.
pub struct JobReloader {
    jobs: Arc<dyn JobStore>,
    queue: Arc<ExclusiveContinuousQueue>,
    clock: Arc<dyn Clock>,
    spread: Duration,
}

impl JobReloader {
    /// Creates a reloader spreading re-admissions over `spread`.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<ExclusiveContinuousQueue>,
        clock: Arc<dyn Clock>,
        spread: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            clock,
            spread,
        }
    }

    /// Spacing between re-admissions of `count` jobs.
    pub fn interval(spread: Duration, count: usize) -> Duration {
        let count = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
        (spread / count).max(Duration::from_millis(1))
    }

    /// Re-admits every unfinished job; returns how many were queued.
    ///
    /// Stops early, without error, once `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<usize> {
        let jobs = self.jobs.non_terminal_continuous_jobs().await?;
        if jobs.is_empty() {
            debug!("no continuous jobs to resume");
            return Ok(0);
        }

        let interval = Self::interval(self.spread, jobs.len());
        info!(jobs = jobs.len(), interval_ms = interval.as_millis() as u64, "resuming continuous jobs");
        let gate = RateGate::new(RateLimit::once_per(interval))?;

        let mut resumed = 0;
        for mut job in jobs {
            if job.credentials.is_none() {
                warn!(job_id = %job.id, subject = %job.subject.user_id, "unfinished job has no credentials, marking failed");
                job.scrub();
                job.transition(JobState::Failed, self.clock.now());
                self.jobs.save_continuous_job(&job).await?;
                continue;
            }

            if let Err(e) = gate.acquire(shutdown).await {
                debug!(error = %e, resumed, "job reload interrupted");
                break;
            }
            let mut record = job.clone();
            match self.queue.enqueue(job, shutdown).await {
                Ok(Admission::Queued) => {
                    debug!(job_id = %record.id, "continuous job resumed");
                    resumed += 1;
                }
                Ok(admission) => {
                    // A newer job for the subject is already active.
                    debug!(job_id = %record.id, ?admission, "continuous job superseded");
                    record.scrub();
                    record.transition(JobState::Completed, self.clock.now());
                    self.jobs.save_continuous_job(&record).await?;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            }
        }

        info!(resumed, "continuous job reload finished");
        Ok(resumed)
    }

    /// Runs [`run`](Self::run) on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<usize>> {
        tokio::spawn(async move { self.run(&shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{ContinuousJob, Credentials, Subject};

    async fn seed(store: &MemoryStore, clock: &ManualClock, key: &str, state: JobState) {
        let mut job = ContinuousJob::new(
            Subject::new(key, format!("ext-{key}"), key),
            Credentials::new("t", "s"),
            format!("{key}@example.org"),
            clock.now(),
        );
        if state != JobState::Pending {
            job.transition(state, clock.now());
        }
        store.save_continuous_job(&job).await.unwrap();
    }

    fn reloader(store: Arc<MemoryStore>, queue: Arc<ExclusiveContinuousQueue>) -> JobReloader {
        JobReloader::new(
            store,
            queue,
            Arc::new(ManualClock::new()),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_interval() {
        let spread = Duration::from_secs(600);
        assert_eq!(JobReloader::interval(spread, 3), Duration::from_secs(200));
        assert_eq!(JobReloader::interval(spread, 1), spread);
        assert_eq!(JobReloader::interval(Duration::from_millis(1), 1000), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_nothing_to_resume() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ExclusiveContinuousQueue::new(4).unwrap());
        let resumed = reloader(store, queue.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed, 0);
        assert_eq!(queue.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_spread_over_window() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        seed(&store, &clock, "a", JobState::Pending).await;
        seed(&store, &clock, "b", JobState::Running).await;
        seed(&store, &clock, "c", JobState::Pending).await;
        seed(&store, &clock, "done", JobState::Completed).await;
        let queue = Arc::new(ExclusiveContinuousQueue::new(8).unwrap());

        let task = reloader(store, queue.clone()).spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.queued_count(), 1);
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(queue.queued_count(), 2);
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(queue.queued_count(), 3);

        assert_eq!(task.await.unwrap().unwrap(), 3);
        assert!(!queue.is_active("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reload() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        seed(&store, &clock, "a", JobState::Pending).await;
        seed(&store, &clock, "b", JobState::Pending).await;
        let queue = Arc::new(ExclusiveContinuousQueue::new(8).unwrap());
        let shutdown = CancellationToken::new();

        let task = reloader(store, queue.clone()).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 1);
        assert_eq!(queue.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_job_without_credentials_is_failed() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        let mut job = ContinuousJob::new(
            Subject::new("a", "ext-a", "a"),
            Credentials::new("t", "s"),
            "a@example.org",
            clock.now(),
        );
        job.credentials = None;
        store.save_continuous_job(&job).await.unwrap();
        let queue = Arc::new(ExclusiveContinuousQueue::new(2).unwrap());

        let resumed = reloader(store.clone(), queue.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed, 0);
        let stored = store.continuous_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }
}
