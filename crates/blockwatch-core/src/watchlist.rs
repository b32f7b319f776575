//! Watch-lists and the provider turning them into reconciliation candidates.

use crate::client::RelationshipClient;
use crate::error::{BlockwatchError, Result};
use crate::types::{Candidate, Category};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A remote list whose members are checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedList {
    /// Screen name of the list owner.
    pub owner: String,
    /// List slug.
    pub slug: String,
    /// Category given to members found on this list.
    #[serde(default)]
    pub category: Category,
}

/// Source of the accounts a reconciliation pass checks.
#[async_trait]
pub trait CandidateSource: Send + Sync + 'static {
    /// Current candidates, unique by external id.
    async fn candidates(&self, cancel: &CancellationToken) -> Result<Arc<Vec<Candidate>>>;
}

struct Cached {
    fetched: Instant,
    candidates: Arc<Vec<Candidate>>,
}

/// Lists the members of every configured watch-list.
///
/// Members listed on several lists keep the category of the first list. The result
/// is cached for `refresh`; concurrent callers wait for a single refresh.
pub struct CandidateProvider {
    client: Arc<dyn RelationshipClient>,
    lists: Vec<WatchedList>,
    refresh: Duration,
    cache: Mutex<Option<Cached>>,
}

impl CandidateProvider {
    /// Creates a provider over `lists`.
    pub fn new(client: Arc<dyn RelationshipClient>, lists: Vec<WatchedList>, refresh: Duration) -> Self {
        Self {
            client,
            lists,
            refresh,
            cache: Mutex::new(None),
        }
    }

    /// The configured lists.
    pub fn lists(&self) -> &[WatchedList] {
        &self.lists
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Candidate>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for list in &self.lists {
            let members = self
                .client
                .list_candidates(&list.owner, &list.slug, cancel)
                .await?;
            debug!(owner = %list.owner, slug = %list.slug, members = members.len(), "listed watch-list");
            for member in members {
                if seen.insert(member.external_id.clone()) {
                    candidates.push(Candidate {
                        external_id: member.external_id,
                        screen_name: member.screen_name,
                        category: list.category,
                    });
                }
            }
        }
        Ok(candidates)
    }
}

#[async_trait]
impl CandidateSource for CandidateProvider {
    async fn candidates(&self, cancel: &CancellationToken) -> Result<Arc<Vec<Candidate>>> {
        // Another subject's refresh may hold the cache for a while.
        let mut cache = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlockwatchError::Cancelled),
            guard = self.cache.lock() => guard,
        };
        if let Some(cached) = cache.as_ref() {
            if cached.fetched.elapsed() < self.refresh {
                return Ok(cached.candidates.clone());
            }
        }
        let candidates = Arc::new(self.fetch(cancel).await?);
        *cache = Some(Cached {
            fetched: Instant::now(),
            candidates: candidates.clone(),
        });
        Ok(candidates)
    }
}

/// A fixed candidate set.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates(Arc<Vec<Candidate>>);

impl StaticCandidates {
    /// Wraps `candidates`.
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self(Arc::new(candidates))
    }
}

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn candidates(&self, _cancel: &CancellationToken) -> Result<Arc<Vec<Candidate>>> {
        Ok(self.0.clone())
    }
}
