//! Durable store: an in-memory store mirrored to a JSON file after every write.
//!
//! Continuous-job credentials are sealed per subject before they reach the file.
//! Without a sealing key they are not written at all, and jobs parked at shutdown
//! cannot be resumed.

use async_trait::async_trait;
use blockwatch_core::store::{BlockChanges, StoreSnapshot};
use blockwatch_core::{
    ArchivedBlock, Block, BlockStore, BlockwatchError, CheckJob, ContinuousJob, CredentialSealer,
    ExceptionLogger, ExceptionRecord, JobId, JobStore, MemoryStore, Result, SealedCredentials,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreFile {
    snapshot: StoreSnapshot,
    sealed: HashMap<JobId, SealedCredentials>,
}

/// JSON-file backed implementation of the persistence contracts.
pub struct FileStore {
    path: PathBuf,
    sealer: Option<CredentialSealer>,
    memory: MemoryStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, creating it on first write if missing.
    pub async fn open(path: impl Into<PathBuf>, sealer: Option<CredentialSealer>) -> Result<Self> {
        let path = path.into();
        if sealer.is_none() {
            warn!(path = %path.display(), "no sealing key configured, credentials will not be persisted");
        }

        let memory = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                let snapshot = unseal(file, sealer.as_ref());
                info!(
                    path = %path.display(),
                    continuous_jobs = snapshot.continuous_jobs.len(),
                    blocks = snapshot.blocks.len(),
                    "store loaded"
                );
                MemoryStore::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "store file missing, starting empty");
                MemoryStore::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            sealer,
            memory,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current contents, replacing the file atomically.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.memory.snapshot();
        let mut sealed = HashMap::new();
        if let Some(sealer) = &self.sealer {
            for job in &snapshot.continuous_jobs {
                if let Some(credentials) = &job.credentials {
                    sealed.insert(job.id, sealer.seal(job.subject_key(), credentials)?);
                }
            }
        }
        let bytes = serde_json::to_vec_pretty(&StoreFile { snapshot, sealed })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "store flushed");
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.flush().await.map_err(|e| BlockwatchError::Store {
            msg: format!("writing {}: {}", self.path.display(), e),
        })
    }
}

fn unseal(file: StoreFile, sealer: Option<&CredentialSealer>) -> StoreSnapshot {
    let StoreFile {
        mut snapshot,
        sealed,
    } = file;
    for job in &mut snapshot.continuous_jobs {
        let Some(entry) = sealed.get(&job.id) else {
            continue;
        };
        let Some(sealer) = sealer else {
            warn!(job_id = %job.id, "sealed credentials present but no sealing key configured");
            continue;
        };
        match sealer.open(job.subject_key(), entry) {
            Ok(credentials) => job.credentials = Some(credentials),
            Err(e) => warn!(job_id = %job.id, error = %e, "could not open sealed credentials"),
        }
    }
    snapshot
}

#[async_trait]
impl JobStore for FileStore {
    async fn save_check_job(&self, job: &CheckJob) -> Result<()> {
        self.memory.save_check_job(job).await?;
        self.persist().await
    }

    async fn latest_check_job(&self, user_id: &str) -> Result<Option<CheckJob>> {
        self.memory.latest_check_job(user_id).await
    }

    async fn save_continuous_job(&self, job: &ContinuousJob) -> Result<()> {
        self.memory.save_continuous_job(job).await?;
        self.persist().await
    }

    async fn continuous_job(&self, id: JobId) -> Result<Option<ContinuousJob>> {
        self.memory.continuous_job(id).await
    }

    async fn non_terminal_continuous_jobs(&self) -> Result<Vec<ContinuousJob>> {
        self.memory.non_terminal_continuous_jobs().await
    }

    async fn continuous_jobs(&self) -> Result<Vec<ContinuousJob>> {
        self.memory.continuous_jobs().await
    }
}

#[async_trait]
impl BlockStore for FileStore {
    async fn blocks_for(&self, subject_id: &str) -> Result<Vec<Block>> {
        self.memory.blocks_for(subject_id).await
    }

    async fn recently_archived(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        self.memory.recently_archived(subject_id, since).await
    }

    async fn archived_for(&self, subject_id: &str) -> Result<Vec<ArchivedBlock>> {
        self.memory.archived_for(subject_id).await
    }

    async fn apply(&self, changes: &BlockChanges) -> Result<()> {
        self.memory.apply(changes).await?;
        self.persist().await
    }
}

#[async_trait]
impl ExceptionLogger for FileStore {
    async fn log(&self, record: ExceptionRecord) -> Result<()> {
        self.memory.log(record).await?;
        self.persist().await
    }
}
