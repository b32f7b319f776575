//! The blockwatch runtime: queues, dispatchers, reloader and their shutdown.

use crate::client::{RateLimitedClient, RelationshipClient};
use crate::clock::Clock;
use crate::config::BlockwatchConfig;
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherHandle};
use crate::error::Result;
use crate::exclusive::{Admission, ExclusiveContinuousQueue};
use crate::notify::{ExceptionLogger, Notifier};
use crate::processor::{CheckJobProcessor, ContinuousJobProcessor, ProcessorContext};
use crate::queue::BoundedJobQueue;
use crate::reconcile::ReconciliationEngine;
use crate::reloader::JobReloader;
use crate::store::{BlockStore, JobStore};
use crate::types::{CheckJob, ContinuousJob, Credentials, JobId, JobState, Subject};
use crate::watchlist::{CandidateProvider, CandidateSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External collaborators of the runtime.
#[derive(Clone)]
pub struct Collaborators {
    /// Job persistence.
    pub jobs: Arc<dyn JobStore>,
    /// Block persistence.
    pub blocks: Arc<dyn BlockStore>,
    /// Remote relationship API, without rate limiting.
    pub client: Arc<dyn RelationshipClient>,
    /// Notification delivery.
    pub notifier: Arc<dyn Notifier>,
    /// Exception log.
    pub exceptions: Arc<dyn ExceptionLogger>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Candidate source; defaults to the configured watch-lists.
    pub candidates: Option<Arc<dyn CandidateSource>>,
}

/// Counters of both dispatchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// One-shot checks.
    pub check: DispatchStats,
    /// Continuous jobs.
    pub continuous: DispatchStats,
}

/// A running blockwatch instance.
pub struct Blockwatch {
    config: BlockwatchConfig,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    client: Arc<RateLimitedClient>,
    check_queue: Arc<BoundedJobQueue<CheckJob>>,
    continuous_queue: Arc<ExclusiveContinuousQueue>,
    check_dispatcher: DispatcherHandle,
    continuous_dispatcher: DispatcherHandle,
    reloader: JoinHandle<Result<usize>>,
    shutdown: CancellationToken,
}

impl Blockwatch {
    /// Validates `config`, starts both dispatchers and resumes unfinished
    /// continuous jobs in the background. Must be called inside a tokio runtime.
    pub fn start(config: BlockwatchConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            jobs,
            blocks,
            client,
            notifier,
            exceptions,
            clock,
            candidates,
        } = collaborators;

        let client = Arc::new(RateLimitedClient::new(
            client,
            config.verify_limit.to_limit(),
            config.list_limit.to_limit(),
        )?);
        let candidates = candidates.unwrap_or_else(|| {
            Arc::new(CandidateProvider::new(
                client.clone(),
                config.watch_lists.clone(),
                config.pass_interval(),
            ))
        });
        let engine = Arc::new(ReconciliationEngine::new(
            client.clone(),
            candidates,
            blocks,
            clock.clone(),
            config.dedup_threshold(),
        ));
        let ctx = ProcessorContext {
            jobs: jobs.clone(),
            engine,
            notifier,
            exceptions,
            clock: clock.clone(),
            links: config.links.clone(),
        };

        let shutdown = CancellationToken::new();
        let check_queue = Arc::new(BoundedJobQueue::new(config.check_queue_capacity)?);
        let continuous_queue = Arc::new(ExclusiveContinuousQueue::new(
            config.continuous_queue_capacity,
        )?);

        let check_dispatcher = Dispatcher::<CheckJob, _, _>::new(
            "check",
            check_queue.clone(),
            Arc::new(CheckJobProcessor::new(ctx.clone())),
        )
        .start(shutdown.clone());
        let continuous_dispatcher = Dispatcher::<ContinuousJob, _, _>::new(
            "continuous",
            continuous_queue.clone(),
            Arc::new(ContinuousJobProcessor::new(ctx, config.pass_interval())),
        )
        .start(shutdown.clone());

        let reloader = JobReloader::new(
            jobs.clone(),
            continuous_queue.clone(),
            clock.clone(),
            config.reload_spread(),
        )
        .spawn(shutdown.clone());

        info!(
            check_capacity = config.check_queue_capacity,
            continuous_capacity = config.continuous_queue_capacity,
            watch_lists = config.watch_lists.len(),
            "blockwatch started"
        );

        Ok(Self {
            config,
            jobs,
            clock,
            client,
            check_queue,
            continuous_queue,
            check_dispatcher,
            continuous_dispatcher,
            reloader,
            shutdown,
        })
    }

    /// Whether a new one-shot check may start for `user_id`: there is no previous
    /// check, the latest one has ended, or it has been silent for longer than the
    /// configured staleness threshold.
    pub async fn can_start_new_check(&self, user_id: &str) -> Result<bool> {
        let Some(latest) = self.jobs.latest_check_job(user_id).await? else {
            return Ok(true);
        };
        if latest.state.is_terminal() {
            return Ok(true);
        }
        Ok(self.clock.now() - latest.last_update > self.config.stale_job_after())
    }

    /// Persists and queues a one-shot check. Returns `None` if one is already under way.
    ///
    /// Waits for a free slot in the check queue.
    pub async fn submit_check(
        &self,
        subject: Subject,
        credentials: Credentials,
        email: impl Into<String>,
    ) -> Result<Option<JobId>> {
        if !self.can_start_new_check(&subject.user_id).await? {
            info!(subject = %subject.user_id, "check already under way");
            return Ok(None);
        }
        let job = CheckJob::new(subject, credentials, email, self.clock.now());
        let id = job.id;
        self.jobs.save_check_job(&job).await?;
        self.check_queue.enqueue(job, &self.shutdown).await?;
        info!(job_id = %id, "check queued");
        Ok(Some(id))
    }

    /// Persists and queues a continuous job for `subject`.
    ///
    /// If one is already active nothing is queued, and the record created for this
    /// request is closed as Completed.
    pub async fn start_continuous(
        &self,
        subject: Subject,
        credentials: Credentials,
        email: impl Into<String>,
    ) -> Result<Admission> {
        if self.continuous_queue.is_active(&subject.user_id) {
            return Ok(Admission::AlreadyActive);
        }
        let job = ContinuousJob::new(subject, credentials, email, self.clock.now());
        self.jobs.save_continuous_job(&job).await?;

        let record = job.clone();
        let admission = match self.continuous_queue.enqueue(job, &self.shutdown).await {
            Ok(admission) => admission,
            Err(e) => {
                self.close_unqueued(record).await?;
                return Err(e);
            }
        };
        if admission != Admission::Queued {
            self.close_unqueued(record).await?;
        }
        Ok(admission)
    }

    async fn close_unqueued(&self, mut record: ContinuousJob) -> Result<()> {
        record.scrub();
        record.transition(JobState::Completed, self.clock.now());
        self.jobs.save_continuous_job(&record).await
    }

    /// Requests termination of `user_id`'s continuous job.
    pub async fn stop_continuous(&self, user_id: &str) -> Result<Admission> {
        self.continuous_queue
            .enqueue(ContinuousJob::terminator(user_id), &self.shutdown)
            .await
    }

    /// The one-shot check queue.
    pub fn check_queue(&self) -> &BoundedJobQueue<CheckJob> {
        &self.check_queue
    }

    /// The continuous queue, including its admin view.
    pub fn continuous_queue(&self) -> &ExclusiveContinuousQueue {
        &self.continuous_queue
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            check: self.check_dispatcher.stats(),
            continuous: self.continuous_dispatcher.stats(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &BlockwatchConfig {
        &self.config
    }

    /// Token that fires when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops dispatching, lets every in-flight job reach its shutdown state and
    /// waits for them, up to the configured grace period per job kind.
    ///
    /// Returns whether every job finished within the grace period.
    pub async fn shutdown(self) -> bool {
        info!("blockwatch shutting down");
        self.shutdown.cancel();

        match self.reloader.await {
            Ok(Ok(resumed)) => info!(resumed, "reloader stopped"),
            Ok(Err(e)) => warn!(error = %e, "reloader failed"),
            Err(e) => warn!(error = %e, "reloader task panicked"),
        }

        let grace = self.config.shutdown_grace();
        let checks = self.check_dispatcher.join(grace).await;
        let continuous = self.continuous_dispatcher.join(grace).await;

        self.check_queue.close();
        self.continuous_queue.close();
        self.client.close();
        info!(drained = checks && continuous, "blockwatch stopped");
        checks && continuous
    }
}
