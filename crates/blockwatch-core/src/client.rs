//! Contract of the remote relationship API and its rate-limited wrapper.

use crate::error::Result;
use crate::rate_gate::{KeyedRateGate, RateGate, RateLimit};
use crate::types::{Credentials, Subject};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A member of a remote list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMember {
    /// Remote id.
    pub external_id: String,
    /// Display name.
    pub screen_name: String,
}

/// Remote API used to enumerate candidates and check relationships.
///
/// Failures are reported as `Unauthorized`, `Transient` or `Permanent`.
#[async_trait]
pub trait RelationshipClient: Send + Sync + 'static {
    /// Members of the list `slug` owned by `owner`.
    async fn list_candidates(
        &self,
        owner: &str,
        slug: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListMember>>;

    /// Whether `candidate_id` currently blocks `subject`.
    async fn verify_relationship(
        &self,
        subject: &Subject,
        credentials: &Credentials,
        candidate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Called once a job for `user_id` has ended for good. Per-subject state
    /// may be released.
    fn subject_finished(&self, _user_id: &str) {}
}

/// Puts every call of an inner client behind a rate gate.
///
/// Relationship checks count against the subject's own gate; list calls share a
/// single application-wide gate.
pub struct RateLimitedClient {
    inner: Arc<dyn RelationshipClient>,
    verify_gates: KeyedRateGate,
    list_gate: RateGate,
}

impl RateLimitedClient {
    /// Wraps `inner`. Must be called inside a tokio runtime.
    pub fn new(
        inner: Arc<dyn RelationshipClient>,
        verify_limit: RateLimit,
        list_limit: RateLimit,
    ) -> Result<Self> {
        Ok(Self {
            inner,
            verify_gates: KeyedRateGate::new(verify_limit)?,
            list_gate: RateGate::new(list_limit)?,
        })
    }

    /// Number of subjects with a verification gate.
    pub fn gated_subjects(&self) -> usize {
        self.verify_gates.len()
    }

    /// Closes every gate; waiting calls fail.
    pub fn close(&self) {
        self.verify_gates.close();
        self.list_gate.close();
    }
}

#[async_trait]
impl RelationshipClient for RateLimitedClient {
    async fn list_candidates(
        &self,
        owner: &str,
        slug: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListMember>> {
        self.list_gate.acquire(cancel).await?;
        self.inner.list_candidates(owner, slug, cancel).await
    }

    async fn verify_relationship(
        &self,
        subject: &Subject,
        credentials: &Credentials,
        candidate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.verify_gates.acquire(&subject.user_id, cancel).await?;
        self.inner
            .verify_relationship(subject, credentials, candidate_id, cancel)
            .await
    }

    fn subject_finished(&self, user_id: &str) {
        // Gates of other subjects may have drained since their jobs ended.
        let evicted = self.verify_gates.evict_idle();
        if evicted > 0 {
            debug!(subject = user_id, evicted, remaining = self.verify_gates.len(), "idle verification gates dropped");
        }
        self.inner.subject_finished(user_id);
    }
}
