//! Test doubles shared by the unit tests.

#![allow(dead_code)]

use crate::client::{ListMember, RelationshipClient};
use crate::clock::ManualClock;
use crate::config::Links;
use crate::error::{BlockwatchError, Result};
use crate::notify::{Notifier, Template, TemplateParams};
use crate::processor::ProcessorContext;
use crate::reconcile::ReconciliationEngine;
use crate::store::MemoryStore;
use crate::types::{Candidate, Category, Credentials, Subject};
use crate::watchlist::StaticCandidates;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure a scripted call raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Unauthorized,
    Transient,
    Permanent,
}

impl Failure {
    fn error(self) -> BlockwatchError {
        match self {
            Failure::Unauthorized => BlockwatchError::Unauthorized,
            Failure::Transient => BlockwatchError::transient("scripted transient failure"),
            Failure::Permanent => BlockwatchError::permanent("scripted permanent failure"),
        }
    }
}

#[derive(Default)]
struct Script {
    blocks: HashSet<(String, String)>,
    lists: HashMap<(String, String), Vec<ListMember>>,
    verify_failures: HashMap<String, Failure>,
    list_failures: HashMap<String, Failure>,
    delay: Option<Duration>,
}

/// Relationship client answering from an editable script.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    script: Mutex<Script>,
    verify_calls: AtomicUsize,
    list_calls: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `holder` blocks the subject with local id `user_id`.
    pub(crate) fn block(&self, user_id: &str, holder: &str) {
        self.script
            .lock()
            .blocks
            .insert((user_id.to_string(), holder.to_string()));
    }

    pub(crate) fn unblock(&self, user_id: &str, holder: &str) {
        self.script
            .lock()
            .blocks
            .remove(&(user_id.to_string(), holder.to_string()));
    }

    pub(crate) fn list(&self, owner: &str, slug: &str, members: &[(&str, &str)]) {
        let members = members
            .iter()
            .map(|(id, name)| ListMember {
                external_id: id.to_string(),
                screen_name: name.to_string(),
            })
            .collect();
        self.script
            .lock()
            .lists
            .insert((owner.to_string(), slug.to_string()), members);
    }

    pub(crate) fn fail_verify(&self, candidate_id: &str, failure: Failure) {
        self.script
            .lock()
            .verify_failures
            .insert(candidate_id.to_string(), failure);
    }

    pub(crate) fn fail_list(&self, slug: &str, failure: Failure) {
        self.script
            .lock()
            .list_failures
            .insert(slug.to_string(), failure);
    }

    pub(crate) fn clear_failures(&self) {
        let mut script = self.script.lock();
        script.verify_failures.clear();
        script.list_failures.clear();
    }

    /// Every verification sleeps this long first.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    pub(crate) fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Subjects reported finished, in order.
    pub(crate) fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl RelationshipClient for ScriptedClient {
    async fn list_candidates(
        &self,
        owner: &str,
        slug: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ListMember>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if let Some(failure) = script.list_failures.get(slug) {
            return Err(failure.error());
        }
        Ok(script
            .lists
            .get(&(owner.to_string(), slug.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn verify_relationship(
        &self,
        subject: &Subject,
        _credentials: &Credentials,
        candidate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().delay;
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BlockwatchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let script = self.script.lock();
        if let Some(failure) = script.verify_failures.get(candidate_id) {
            return Err(failure.error());
        }
        Ok(script
            .blocks
            .contains(&(subject.user_id.clone(), candidate_id.to_string())))
    }

    fn subject_finished(&self, user_id: &str) {
        self.finished.lock().push(user_id.to_string());
    }
}

/// Candidates whose id and screen name are both `id`.
pub(crate) fn candidates(ids: &[&str]) -> Vec<Candidate> {
    ids.iter()
        .map(|id| Candidate {
            external_id: id.to_string(),
            screen_name: id.to_string(),
            category: Category::Unspecified,
        })
        .collect()
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Sent {
    pub(crate) address: String,
    pub(crate) template: Template,
    pub(crate) params: TemplateParams,
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub(crate) fn templates(&self) -> Vec<Template> {
        self.sent.lock().iter().map(|s| s.template).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, address: &str, template: Template, params: &TemplateParams) -> Result<()> {
        self.sent.lock().push(Sent {
            address: address.to_string(),
            template,
            params: params.clone(),
        });
        Ok(())
    }
}

/// Processor collaborators wired to in-memory doubles.
pub(crate) struct Harness {
    pub(crate) client: Arc<ScriptedClient>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) ctx: ProcessorContext,
}

impl Harness {
    /// Watches `members`; dedup threshold 90 minutes.
    pub(crate) fn new(members: &[&str]) -> Self {
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let engine = ReconciliationEngine::new(
            client.clone(),
            Arc::new(StaticCandidates::new(candidates(members))),
            store.clone(),
            clock.clone(),
            chrono::Duration::minutes(90),
        );
        let ctx = ProcessorContext {
            jobs: store.clone(),
            engine: Arc::new(engine),
            notifier: notifier.clone(),
            exceptions: store.clone(),
            clock: clock.clone(),
            links: Links::default(),
        };
        Self {
            client,
            store,
            notifier,
            clock,
            ctx,
        }
    }
}
