use super::{JobProcessor, ProcessorContext};
use crate::error::{BlockwatchError, Result};
use crate::notify::{Template, CHECK_JOB_CONTEXT};
use crate::queue::Release;
use crate::reconcile::PassOutcome;
use crate::types::{CheckJob, JobState};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs a single reconciliation pass per job.
pub struct CheckJobProcessor {
    ctx: ProcessorContext,
}

impl CheckJobProcessor {
    /// Creates the processor.
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }

    async fn persist(&self, job: &mut CheckJob, state: JobState) {
        job.transition(state, self.ctx.clock.now());
        if let Err(e) = self.ctx.jobs.save_check_job(job).await {
            warn!(job_id = %job.id, state = %state, error = %e, "failed to persist check job");
        }
    }

    async fn run(&self, job: &CheckJob, shutdown: &CancellationToken) -> Result<PassOutcome> {
        let credentials = job
            .credentials
            .as_ref()
            .ok_or_else(|| BlockwatchError::permanent("check job carries no credentials"))?;
        self.ctx
            .engine
            .run_pass(&job.subject, credentials, shutdown)
            .await
    }
}

#[async_trait]
impl JobProcessor<CheckJob> for CheckJobProcessor {
    async fn process(
        &self,
        mut job: CheckJob,
        release: Release,
        shutdown: CancellationToken,
    ) -> JobState {
        self.persist(&mut job, JobState::Running).await;
        info!(job_id = %job.id, subject = %job.subject.user_id, "checking blocks");

        let email = job.email.clone();
        let email = email.as_deref();
        let state = match self.run(&job, &shutdown).await {
            Ok(outcome) => {
                self.ctx
                    .notify(job.id, email, &job.subject, Template::Completed)
                    .await;
                info!(
                    job_id = %job.id,
                    added = outcome.added.len(),
                    removed = outcome.removed.len(),
                    "check job completed"
                );
                JobState::Completed
            }
            Err(e) if e.is_unauthorized() => {
                error!(job_id = %job.id, subject = %job.subject.user_id, "credentials rejected while checking blocks");
                self.ctx
                    .log_exception(job.id, CHECK_JOB_CONTEXT, &job.subject, &e)
                    .await;
                self.ctx
                    .notify(job.id, email, &job.subject, Template::UnauthorizedError)
                    .await;
                JobState::Failed
            }
            Err(e) if e.is_cancelled() => {
                self.ctx
                    .log_exception(job.id, CHECK_JOB_CONTEXT, &job.subject, &e)
                    .await;
                warn!(job_id = %job.id, subject = %job.subject.user_id, "check job cancelled");
                JobState::Failed
            }
            Err(e) => {
                self.ctx
                    .log_exception(job.id, CHECK_JOB_CONTEXT, &job.subject, &e)
                    .await;
                error!(job_id = %job.id, subject = %job.subject.user_id, error = %e, "check job failed");
                self.ctx
                    .notify(job.id, email, &job.subject, Template::Failed)
                    .await;
                JobState::Failed
            }
        };

        self.persist(&mut job, state).await;
        self.ctx.engine.subject_finished(&job.subject.user_id);
        release.release_terminal();
        state
    }
}
