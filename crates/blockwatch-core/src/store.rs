//! Persistence contracts and an in-memory implementation.

use crate::error::Result;
use crate::notify::{ExceptionLogger, ExceptionRecord};
use crate::types::{ArchivedBlock, Block, CheckJob, ContinuousJob, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Job persistence.
///
/// One-shot jobs are stored without credentials or contact address. Continuous
/// jobs keep both until they are scrubbed, so they can be resumed after a restart.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Inserts or updates a one-shot job.
    async fn save_check_job(&self, job: &CheckJob) -> Result<()>;

    /// Most recently created one-shot job of `user_id`.
    async fn latest_check_job(&self, user_id: &str) -> Result<Option<CheckJob>>;

    /// Inserts or updates a continuous job.
    async fn save_continuous_job(&self, job: &ContinuousJob) -> Result<()>;

    /// A continuous job by id.
    async fn continuous_job(&self, id: JobId) -> Result<Option<ContinuousJob>>;

    /// Continuous jobs in state Pending or Running.
    async fn non_terminal_continuous_jobs(&self) -> Result<Vec<ContinuousJob>>;

    /// Every continuous job.
    async fn continuous_jobs(&self) -> Result<Vec<ContinuousJob>>;
}

/// Mutations produced by one reconciliation pass, applied together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockChanges {
    /// Blocks confirmed again, with `checked` refreshed.
    pub refreshed: Vec<Block>,
    /// Blocks observed for the first time.
    pub created: Vec<Block>,
    /// Blocks no longer observed, replacing the block with id `.0`.
    pub archived: Vec<(Uuid, ArchivedBlock)>,
}

impl BlockChanges {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.refreshed.is_empty() && self.created.is_empty() && self.archived.is_empty()
    }
}

/// Block persistence.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Blocks currently held against `subject_id`.
    async fn blocks_for(&self, subject_id: &str) -> Result<Vec<Block>>;

    /// Latest `verified_gone` per holder for blocks of `subject_id` archived at or after `since`.
    async fn recently_archived(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, DateTime<Utc>>>;

    /// Archived blocks of `subject_id`.
    async fn archived_for(&self, subject_id: &str) -> Result<Vec<ArchivedBlock>>;

    /// Applies `changes`; archiving removes the replaced block.
    async fn apply(&self, changes: &BlockChanges) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct Tables {
    check_jobs: Vec<CheckJob>,
    continuous_jobs: HashMap<JobId, ContinuousJob>,
    blocks: HashMap<Uuid, Block>,
    archived: Vec<ArchivedBlock>,
    exceptions: Vec<ExceptionRecord>,
}

/// Everything a [`MemoryStore`] holds, used to persist and restore it.
///
/// Serializing a snapshot drops job credentials; callers that need them on disk
/// seal them separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    /// One-shot jobs in creation order.
    pub check_jobs: Vec<CheckJob>,
    /// Continuous jobs, credentials included.
    pub continuous_jobs: Vec<ContinuousJob>,
    /// Live blocks.
    pub blocks: Vec<Block>,
    /// Archived blocks.
    pub archived: Vec<ArchivedBlock>,
    /// Exception log.
    pub exceptions: Vec<ExceptionRecord>,
}

/// Store keeping every table in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a store from `snapshot`.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let tables = Tables {
            check_jobs: snapshot.check_jobs,
            continuous_jobs: snapshot
                .continuous_jobs
                .into_iter()
                .map(|job| (job.id, job))
                .collect(),
            blocks: snapshot.blocks.into_iter().map(|b| (b.id, b)).collect(),
            archived: snapshot.archived,
            exceptions: snapshot.exceptions,
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Copies the current contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.read();
        let mut continuous_jobs: Vec<ContinuousJob> =
            tables.continuous_jobs.values().cloned().collect();
        continuous_jobs.sort_by_key(|job| job.last_update);
        let mut blocks: Vec<Block> = tables.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.first_seen);
        StoreSnapshot {
            check_jobs: tables.check_jobs.clone(),
            continuous_jobs,
            blocks,
            archived: tables.archived.clone(),
            exceptions: tables.exceptions.clone(),
        }
    }

    /// Logged exceptions, oldest first.
    pub fn exceptions(&self) -> Vec<ExceptionRecord> {
        self.tables.read().exceptions.clone()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_check_job(&self, job: &CheckJob) -> Result<()> {
        let stored = job.without_secrets();
        let mut tables = self.tables.write();
        match tables.check_jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = stored,
            None => tables.check_jobs.push(stored),
        }
        Ok(())
    }

    async fn latest_check_job(&self, user_id: &str) -> Result<Option<CheckJob>> {
        let tables = self.tables.read();
        Ok(tables
            .check_jobs
            .iter()
            .rev()
            .find(|j| j.subject.user_id == user_id)
            .cloned())
    }

    async fn save_continuous_job(&self, job: &ContinuousJob) -> Result<()> {
        let mut stored = job.clone();
        stored.cancel = None;
        stored.terminate = false;
        self.tables.write().continuous_jobs.insert(job.id, stored);
        Ok(())
    }

    async fn continuous_job(&self, id: JobId) -> Result<Option<ContinuousJob>> {
        Ok(self.tables.read().continuous_jobs.get(&id).cloned())
    }

    async fn non_terminal_continuous_jobs(&self) -> Result<Vec<ContinuousJob>> {
        let tables = self.tables.read();
        let mut jobs: Vec<ContinuousJob> = tables
            .continuous_jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.last_update);
        Ok(jobs)
    }

    async fn continuous_jobs(&self) -> Result<Vec<ContinuousJob>> {
        Ok(self.snapshot().continuous_jobs)
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn blocks_for(&self, subject_id: &str) -> Result<Vec<Block>> {
        let tables = self.tables.read();
        Ok(tables
            .blocks
            .values()
            .filter(|b| b.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn recently_archived(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let tables = self.tables.read();
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for archived in tables
            .archived
            .iter()
            .filter(|a| a.subject_id == subject_id && a.verified_gone >= since)
        {
            latest
                .entry(archived.holder_id.clone())
                .and_modify(|t| *t = (*t).max(archived.verified_gone))
                .or_insert(archived.verified_gone);
        }
        Ok(latest)
    }

    async fn archived_for(&self, subject_id: &str) -> Result<Vec<ArchivedBlock>> {
        let tables = self.tables.read();
        Ok(tables
            .archived
            .iter()
            .filter(|a| a.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn apply(&self, changes: &BlockChanges) -> Result<()> {
        let mut tables = self.tables.write();
        for block in changes.refreshed.iter().chain(changes.created.iter()) {
            tables.blocks.insert(block.id, block.clone());
        }
        for (block_id, archived) in &changes.archived {
            tables.blocks.remove(block_id);
            tables.archived.push(archived.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ExceptionLogger for MemoryStore {
    async fn log(&self, record: ExceptionRecord) -> Result<()> {
        self.tables.write().exceptions.push(record);
        Ok(())
    }
}
