//! Reconciliation of observed blocks against persisted ones.

use crate::client::RelationshipClient;
use crate::clock::Clock;
use crate::error::{BlockwatchError, Result};
use crate::store::{BlockChanges, BlockStore};
use crate::types::{ArchivedBlock, Block, Credentials, Subject};
use crate::watchlist::CandidateSource;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    /// Mutations that were persisted.
    pub changes: BlockChanges,
    /// Holders announced as newly blocking.
    pub added: Vec<String>,
    /// Holders whose block vanished.
    pub removed: Vec<String>,
    /// Holders blocking again shortly after being archived; persisted, not announced.
    pub suppressed: Vec<String>,
}

impl PassOutcome {
    /// Whether any block is announced as new.
    pub fn has_added(&self) -> bool {
        !self.added.is_empty()
    }

    /// Whether any block vanished.
    pub fn has_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Whether the subject should hear about this pass.
    pub fn should_notify(&self) -> bool {
        self.has_added() || self.has_removed()
    }
}

/// Compares the holders verified in this pass with the persisted blocks.
///
/// `recently_archived` maps holder ids to their latest `verified_gone`. A block that
/// reappears no more than `dedup_threshold` after it was archived is recreated but
/// not announced.
pub fn diff(
    subject_id: &str,
    existing: &[Block],
    observed: &HashSet<String>,
    recently_archived: &HashMap<String, DateTime<Utc>>,
    dedup_threshold: Duration,
    now: DateTime<Utc>,
) -> PassOutcome {
    let mut outcome = PassOutcome::default();
    let mut known = HashSet::with_capacity(existing.len());

    for block in existing {
        known.insert(block.holder_id.as_str());
        if observed.contains(&block.holder_id) {
            let mut refreshed = block.clone();
            refreshed.checked = now;
            outcome.changes.refreshed.push(refreshed);
        } else {
            outcome
                .changes
                .archived
                .push((block.id, ArchivedBlock::from_block(block, now)));
            outcome.removed.push(block.holder_id.clone());
        }
    }

    let mut fresh: Vec<&String> = observed
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .collect();
    fresh.sort();

    for holder_id in fresh {
        outcome
            .changes
            .created
            .push(Block::observed(subject_id, holder_id.as_str(), now));
        let flapped = recently_archived
            .get(holder_id)
            .is_some_and(|gone| now - *gone <= dedup_threshold);
        if flapped {
            outcome.suppressed.push(holder_id.clone());
        } else {
            outcome.added.push(holder_id.clone());
        }
    }

    outcome
}

/// Runs reconciliation passes for subjects.
pub struct ReconciliationEngine {
    client: Arc<dyn RelationshipClient>,
    candidates: Arc<dyn CandidateSource>,
    blocks: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    dedup_threshold: Duration,
}

impl ReconciliationEngine {
    /// Creates an engine.
    pub fn new(
        client: Arc<dyn RelationshipClient>,
        candidates: Arc<dyn CandidateSource>,
        blocks: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        dedup_threshold: Duration,
    ) -> Self {
        Self {
            client,
            candidates,
            blocks,
            clock,
            dedup_threshold,
        }
    }

    /// Tells the client that `user_id` has no job left.
    pub fn subject_finished(&self, user_id: &str) {
        self.client.subject_finished(user_id);
    }

    /// Verifies every candidate once and persists the resulting changes.
    ///
    /// Any failed verification aborts the pass before anything is written.
    pub async fn run_pass(
        &self,
        subject: &Subject,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome> {
        let candidates = self.candidates.candidates(cancel).await?;
        let existing = self.blocks.blocks_for(&subject.user_id).await?;

        let mut verified = HashSet::new();
        let mut observed = HashSet::new();
        for candidate in candidates.iter() {
            if candidate.external_id == subject.external_id
                || !verified.insert(candidate.external_id.as_str())
            {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(BlockwatchError::Cancelled);
            }
            let blocked = self
                .client
                .verify_relationship(subject, credentials, &candidate.external_id, cancel)
                .await?;
            if blocked {
                debug!(subject = %subject.user_id, holder = %candidate.screen_name, "block observed");
                observed.insert(candidate.external_id.clone());
            }
        }

        let now = self.clock.now();
        let recent = self
            .blocks
            .recently_archived(&subject.user_id, now - self.dedup_threshold)
            .await?;
        let outcome = diff(
            &subject.user_id,
            &existing,
            &observed,
            &recent,
            self.dedup_threshold,
            now,
        );
        if !outcome.changes.is_empty() {
            self.blocks.apply(&outcome.changes).await?;
        }

        info!(
            subject = %subject.user_id,
            checked = verified.len(),
            blocking = observed.len(),
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            suppressed = outcome.suppressed.len(),
            "reconciliation pass finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::{candidates, Failure, ScriptedClient};
    use crate::watchlist::StaticCandidates;
    use proptest::prelude::*;

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn subject() -> Subject {
        Subject::new("local-1", "self", "alice")
    }

    #[test]
    fn test_diff_added_removed_refreshed() {
        let clock = ManualClock::new();
        let earlier = clock.now();
        let a = Block::observed("local-1", "A", earlier);
        let b = Block::observed("local-1", "B", earlier);
        clock.advance(Duration::hours(1));
        let now = clock.now();

        let outcome = diff(
            "local-1",
            &[a.clone(), b.clone()],
            &ids(&["B", "C"]),
            &HashMap::new(),
            Duration::minutes(90),
            now,
        );

        assert_eq!(outcome.added, vec!["C".to_string()]);
        assert_eq!(outcome.removed, vec!["A".to_string()]);
        let created = &outcome.changes.created[0];
        assert_eq!(created.holder_id, "C");
        assert_eq!(created.first_seen, now);
        assert_eq!(created.checked, now);

        let (removed_id, archived) = &outcome.changes.archived[0];
        assert_eq!(*removed_id, a.id);
        assert_eq!(archived.verified_gone, now);
        assert_eq!(archived.first_seen, earlier);
        assert_eq!(archived.checked, earlier);

        let refreshed = &outcome.changes.refreshed[0];
        assert_eq!(refreshed.id, b.id);
        assert_eq!(refreshed.first_seen, earlier);
        assert_eq!(refreshed.checked, now);
    }

    #[test]
    fn test_diff_dedup_threshold() {
        let clock = ManualClock::new();
        let gone = clock.now();
        let recent: HashMap<String, DateTime<Utc>> = [("X".to_string(), gone)].into();

        let soon = diff(
            "local-1",
            &[],
            &ids(&["X"]),
            &recent,
            Duration::minutes(90),
            gone + Duration::minutes(30),
        );
        assert!(soon.added.is_empty());
        assert_eq!(soon.suppressed, vec!["X".to_string()]);
        assert_eq!(soon.changes.created.len(), 1);
        assert!(!soon.should_notify());

        let later = diff(
            "local-1",
            &[],
            &ids(&["X"]),
            &recent,
            Duration::minutes(90),
            gone + Duration::minutes(120),
        );
        assert_eq!(later.added, vec!["X".to_string()]);
        assert!(later.should_notify());
    }

    #[test]
    fn test_diff_nothing_changed() {
        let clock = ManualClock::new();
        let a = Block::observed("local-1", "A", clock.now());
        let outcome = diff(
            "local-1",
            &[a],
            &ids(&["A"]),
            &HashMap::new(),
            Duration::minutes(90),
            clock.now(),
        );
        assert!(!outcome.should_notify());
        assert_eq!(outcome.changes.refreshed.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_diff_partitions_holders(
            existing in proptest::collection::hash_set(0u8..32, 0..16),
            observed in proptest::collection::hash_set(0u8..32, 0..16),
        ) {
            let now = Utc::now();
            let blocks: Vec<Block> = existing
                .iter()
                .map(|id| Block::observed("s", id.to_string(), now - Duration::hours(1)))
                .collect();
            let observed: HashSet<String> = observed.iter().map(|id| id.to_string()).collect();
            let outcome = diff("s", &blocks, &observed, &HashMap::new(), Duration::minutes(90), now);

            let existing: HashSet<String> = existing.iter().map(|id| id.to_string()).collect();
            let created: HashSet<String> =
                outcome.changes.created.iter().map(|b| b.holder_id.clone()).collect();
            let archived: HashSet<String> =
                outcome.changes.archived.iter().map(|(_, a)| a.holder_id.clone()).collect();
            let refreshed: HashSet<String> =
                outcome.changes.refreshed.iter().map(|b| b.holder_id.clone()).collect();

            let expect_created: HashSet<String> = observed.difference(&existing).cloned().collect();
            let expect_archived: HashSet<String> = existing.difference(&observed).cloned().collect();
            let expect_refreshed: HashSet<String> = existing.intersection(&observed).cloned().collect();
            prop_assert_eq!(&created, &expect_created);
            prop_assert_eq!(&archived, &expect_archived);
            prop_assert_eq!(&refreshed, &expect_refreshed);
            prop_assert!(created.is_disjoint(&archived));
            prop_assert_eq!(outcome.added.len(), created.len());
            prop_assert_eq!(outcome.removed.len(), archived.len());
        }
    }

    struct Fixture {
        client: Arc<ScriptedClient>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: ReconciliationEngine,
    }

    fn fixture(members: &[&str]) -> Fixture {
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let engine = ReconciliationEngine::new(
            client.clone(),
            Arc::new(StaticCandidates::new(candidates(members))),
            store.clone(),
            clock.clone(),
            Duration::minutes(90),
        );
        Fixture {
            client,
            store,
            clock,
            engine,
        }
    }

    #[tokio::test]
    async fn test_pass_persists_and_archives() {
        let f = fixture(&["A", "B", "C"]);
        let creds = Credentials::new("t", "s");
        let cancel = CancellationToken::new();

        f.client.block("local-1", "A");
        f.client.block("local-1", "B");
        let first = f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        assert_eq!(first.added, vec!["A".to_string(), "B".to_string()]);

        f.clock.advance(Duration::hours(1));
        f.client.unblock("local-1", "A");
        f.client.block("local-1", "C");
        let second = f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        assert_eq!(second.added, vec!["C".to_string()]);
        assert_eq!(second.removed, vec!["A".to_string()]);

        let mut live: Vec<String> = f
            .store
            .blocks_for("local-1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.holder_id)
            .collect();
        live.sort();
        assert_eq!(live, vec!["B".to_string(), "C".to_string()]);
        let archived = f.store.archived_for("local-1").await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].holder_id, "A");
    }

    #[tokio::test]
    async fn test_pass_suppresses_flapping_block() {
        let f = fixture(&["X"]);
        let creds = Credentials::new("t", "s");
        let cancel = CancellationToken::new();

        f.client.block("local-1", "X");
        f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        f.client.unblock("local-1", "X");
        f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();

        f.clock.advance(Duration::minutes(30));
        f.client.block("local-1", "X");
        let flap = f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        assert!(!flap.should_notify());
        assert_eq!(f.store.blocks_for("local-1").await.unwrap().len(), 1);

        f.client.unblock("local-1", "X");
        f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        f.clock.advance(Duration::minutes(120));
        f.client.block("local-1", "X");
        let back = f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();
        assert_eq!(back.added, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn test_pass_skips_subject_and_duplicates() {
        let f = fixture(&["self", "A", "A"]);
        let creds = Credentials::new("t", "s");
        f.engine
            .run_pass(&subject(), &creds, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.client.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_verification_writes_nothing() {
        let f = fixture(&["A", "B"]);
        let creds = Credentials::new("t", "s");
        let cancel = CancellationToken::new();
        f.client.block("local-1", "A");
        f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap();

        f.client.fail_verify("B", Failure::Transient);
        let err = f.engine.run_pass(&subject(), &creds, &cancel).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.store.blocks_for("local-1").await.unwrap().len(), 1);
        assert!(f.store.archived_for("local-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_propagates() {
        let f = fixture(&["A"]);
        f.client.fail_verify("A", Failure::Unauthorized);
        let err = f
            .engine
            .run_pass(&subject(), &Credentials::new("t", "s"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }
}
