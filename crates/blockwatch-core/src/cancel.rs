//! Combining a job's own cancellation handle with the process shutdown signal.

use tokio_util::sync::{CancellationToken, DropGuard};

/// Which of the two linked signals fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// The per-subject handle: a terminate request for this subject.
    Job,
    /// The process-wide shutdown signal.
    Shutdown,
}

/// A token that fires when either the job handle or the shutdown signal fires.
///
/// Waiting happens on [`token`](Self::token); which source fired is read back from
/// the sources themselves, never from which wait returned. If both are set the job
/// handle wins.
pub struct LinkedCancellation {
    job: CancellationToken,
    shutdown: CancellationToken,
    linked: CancellationToken,
    _guard: DropGuard,
}

impl LinkedCancellation {
    /// Links `job` and `shutdown`. Must be called inside a tokio runtime.
    pub fn new(job: CancellationToken, shutdown: CancellationToken) -> Self {
        let linked = CancellationToken::new();

        if job.is_cancelled() || shutdown.is_cancelled() {
            linked.cancel();
        } else {
            let (job, shutdown, linked) = (job.clone(), shutdown.clone(), linked.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = job.cancelled() => linked.cancel(),
                    _ = shutdown.cancelled() => linked.cancel(),
                    // Owner dropped: nothing left to forward.
                    _ = linked.cancelled() => {}
                }
            });
        }

        Self {
            _guard: linked.clone().drop_guard(),
            job,
            shutdown,
            linked,
        }
    }

    /// The combined token to pass to cancellable operations.
    pub fn token(&self) -> &CancellationToken {
        &self.linked
    }

    /// Whether either source has fired.
    pub fn is_cancelled(&self) -> bool {
        self.job.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// The source that fired, if any.
    pub fn source(&self) -> Option<CancelSource> {
        if self.job.is_cancelled() {
            Some(CancelSource::Job)
        } else if self.shutdown.is_cancelled() {
            Some(CancelSource::Shutdown)
        } else {
            None
        }
    }
}
