use super::{JobProcessor, ProcessorContext};
use crate::cancel::{CancelSource, LinkedCancellation};
use crate::error::BlockwatchError;
use crate::notify::{Template, CONTINUOUS_JOB_CONTEXT};
use crate::queue::Release;
use crate::rate_gate::{RateGate, RateLimit};
use crate::types::{ContinuousJob, JobState};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Loops reconciliation passes, at most one per `pass_interval`, until the job is
/// terminated, the process shuts down, or a pass fails for good.
///
/// | Ending                  | State     | Secrets  |
/// |-------------------------|-----------|----------|
/// | terminate request       | Completed | scrubbed |
/// | shutdown                | Pending   | kept     |
/// | unauthorized/permanent  | Failed    | scrubbed |
pub struct ContinuousJobProcessor {
    ctx: ProcessorContext,
    pass_interval: Duration,
}

impl ContinuousJobProcessor {
    /// Creates the processor.
    pub fn new(ctx: ProcessorContext, pass_interval: Duration) -> Self {
        Self { ctx, pass_interval }
    }

    async fn persist(&self, job: &mut ContinuousJob, state: JobState) {
        job.transition(state, self.ctx.clock.now());
        if let Err(e) = self.ctx.jobs.save_continuous_job(job).await {
            warn!(job_id = %job.id, state = %state, error = %e, "failed to persist continuous job");
        }
    }

    /// Runs passes until one fails for good or a cancellation fires; returns why it stopped.
    async fn drive(&self, job: &mut ContinuousJob, cancel: &LinkedCancellation) -> BlockwatchError {
        let Some(credentials) = job.credentials.clone() else {
            return BlockwatchError::permanent("continuous job carries no credentials");
        };
        let gate = match RateGate::new(RateLimit::once_per(self.pass_interval)) {
            Ok(gate) => gate,
            Err(e) => return e,
        };

        loop {
            if cancel.is_cancelled() {
                return BlockwatchError::Cancelled;
            }
            if let Err(e) = gate.acquire(cancel.token()).await {
                return e;
            }

            match self
                .ctx
                .engine
                .run_pass(&job.subject, &credentials, cancel.token())
                .await
            {
                Ok(outcome) => {
                    job.last_update = self.ctx.clock.now();
                    if let Err(e) = self.ctx.jobs.save_continuous_job(job).await {
                        warn!(job_id = %job.id, error = %e, "failed to record pass");
                    }
                    if outcome.should_notify() {
                        self.ctx
                            .notify(
                                job.id,
                                job.email.as_deref(),
                                &job.subject,
                                Template::BlocksUpdated,
                            )
                            .await;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(job_id = %job.id, subject = %job.subject.user_id, error = %e, "pass failed, retrying next interval");
                }
                Err(e) => return e,
            }
        }
    }

    async fn fail(&self, job: &mut ContinuousJob, error: &BlockwatchError, template: Template) {
        self.ctx
            .log_exception(job.id, CONTINUOUS_JOB_CONTEXT, &job.subject, error)
            .await;
        self.ctx
            .notify(job.id, job.email.as_deref(), &job.subject, template)
            .await;
        job.scrub();
        self.persist(job, JobState::Failed).await;
    }
}

#[async_trait]
impl JobProcessor<ContinuousJob> for ContinuousJobProcessor {
    async fn process(
        &self,
        mut job: ContinuousJob,
        release: Release,
        shutdown: CancellationToken,
    ) -> JobState {
        let handle = job.cancel_token().cloned().unwrap_or_default();
        let cancel = LinkedCancellation::new(handle, shutdown);

        self.persist(&mut job, JobState::Running).await;
        info!(job_id = %job.id, subject = %job.subject.user_id, "watching blocks");

        let stopped = self.drive(&mut job, &cancel).await;

        let state = if stopped.is_cancelled() || cancel.is_cancelled() {
            match cancel.source() {
                Some(CancelSource::Job) => {
                    info!(job_id = %job.id, subject = %job.subject.user_id, "continuous job terminated");
                    job.scrub();
                    self.persist(&mut job, JobState::Completed).await;
                    JobState::Completed
                }
                Some(CancelSource::Shutdown) | None => {
                    warn!(job_id = %job.id, subject = %job.subject.user_id, "continuous job paused by shutdown");
                    self.persist(&mut job, JobState::Pending).await;
                    JobState::Pending
                }
            }
        } else if stopped.is_unauthorized() {
            error!(job_id = %job.id, subject = %job.subject.user_id, "credentials rejected, stopping continuous job");
            self.fail(&mut job, &stopped, Template::UnauthorizedError).await;
            JobState::Failed
        } else {
            error!(job_id = %job.id, subject = %job.subject.user_id, error = %stopped, "continuous job failed");
            self.fail(&mut job, &stopped, Template::Failed).await;
            JobState::Failed
        };

        if state.is_terminal() {
            self.ctx.engine.subject_finished(&job.subject.user_id);
            release.release_terminal();
        } else {
            release.release();
        }
        state
    }
}
