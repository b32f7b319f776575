//! Job processors: the state machines run for each dequeued job.

mod check;
mod continuous;

pub use check::CheckJobProcessor;
pub use continuous::ContinuousJobProcessor;

use crate::clock::Clock;
use crate::config::Links;
use crate::error::BlockwatchError;
use crate::notify::{ExceptionLogger, ExceptionRecord, Notifier, Template};
use crate::queue::Release;
use crate::reconcile::ReconciliationEngine;
use crate::store::JobStore;
use crate::types::{JobId, JobState, Subject};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs one dequeued job of kind `T` to its end.
///
/// Implementations release the job's capacity slot exactly once, whatever the
/// outcome, and return the state the job was left in.
#[async_trait]
pub trait JobProcessor<T: Send + 'static>: Send + Sync + 'static {
    /// Processes `job`. `shutdown` is the process-wide shutdown signal.
    async fn process(&self, job: T, release: Release, shutdown: CancellationToken) -> JobState;
}

/// Collaborators shared by the processors.
#[derive(Clone)]
pub struct ProcessorContext {
    /// Job persistence.
    pub jobs: Arc<dyn JobStore>,
    /// Reconciliation engine.
    pub engine: Arc<ReconciliationEngine>,
    /// Notification delivery.
    pub notifier: Arc<dyn Notifier>,
    /// Exception log.
    pub exceptions: Arc<dyn ExceptionLogger>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Links embedded in notifications.
    pub links: Links,
}

impl ProcessorContext {
    /// Sends `template` to `email`, if the job has one. Failures are logged only.
    pub(crate) async fn notify(
        &self,
        job_id: JobId,
        email: Option<&str>,
        subject: &Subject,
        template: Template,
    ) {
        let Some(address) = email.filter(|a| !a.trim().is_empty()) else {
            debug!(job_id = %job_id, template = %template, "no contact address, notification skipped");
            return;
        };
        let params = template.params(&subject.screen_name, &self.links);
        if let Err(e) = self.notifier.send(address, template, &params).await {
            warn!(job_id = %job_id, template = %template, error = %e, "failed to send notification");
        }
    }

    /// Writes `error` to the exception log. Failures are logged only.
    pub(crate) async fn log_exception(
        &self,
        job_id: JobId,
        context: &str,
        subject: &Subject,
        error: &BlockwatchError,
    ) {
        let record = ExceptionRecord::new(job_id, context, error, self.clock.now()).with_payload(
            serde_json::json!({
                "user_id": subject.user_id,
                "screen_name": subject.screen_name,
            }),
        );
        if let Err(e) = self.exceptions.log(record).await {
            warn!(job_id = %job_id, error = %e, "failed to record exception");
        }
    }
}
