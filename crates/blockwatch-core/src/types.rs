//! Jobs, blocks and the other records the core reads and writes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a persisted job.
pub type JobId = Uuid;

/// A continuous job that has not been updated for this long is reported as stale.
pub const CONTINUOUS_STALE_AFTER_MINS: i64 = 30;

/// Lifecycle state of a job.
///
/// Transitions only move forward, except `Running -> Pending`, which is how a
/// continuous job is parked at shutdown so it can be resumed on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobState {
    /// Waiting in a queue or waiting to be resumed.
    #[default]
    Pending,
    /// Dequeued and being processed.
    Running,
    /// Finished normally (or terminated on request).
    Completed,
    /// Aborted by an error.
    Failed,
}

impl JobState {
    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `self -> next` is a legal transition: nothing leaves a terminal state.
    pub fn can_transition_to(&self, _next: JobState) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The person whose blocks are being watched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Subject {
    /// Local account id. Also the subject key partitioning continuous jobs.
    pub user_id: String,
    /// Id of the subject on the remote platform.
    pub external_id: String,
    /// Display name on the remote platform.
    pub screen_name: String,
}

impl Subject {
    /// Creates a subject.
    pub fn new(
        user_id: impl Into<String>,
        external_id: impl Into<String>,
        screen_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            external_id: external_id.into(),
            screen_name: screen_name.into(),
        }
    }
}

/// Access token pair granted by the subject. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// User access token.
    pub access_token: String,
    /// User access token secret.
    pub access_token_secret: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(access_token: impl Into<String>, access_token_secret: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            access_token_secret: access_token_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED])")
    }
}

/// A single reconciliation pass requested by a subject.
///
/// Credentials and contact address exist only for the lifetime of the process;
/// they are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckJob {
    /// Job id.
    pub id: JobId,
    /// Last time the job was persisted.
    pub last_update: DateTime<Utc>,
    /// Current state.
    pub state: JobState,
    /// The subject being checked.
    pub subject: Subject,
    /// Transient credentials.
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Transient contact address for notifications.
    #[serde(skip)]
    pub email: Option<String>,
}

impl CheckJob {
    /// Creates a pending job.
    pub fn new(
        subject: Subject,
        credentials: Credentials,
        email: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_update: now,
            state: JobState::Pending,
            subject,
            credentials: Some(credentials),
            email: Some(email.into()),
        }
    }

    /// Moves the job to `next` and stamps it.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.last_update = now;
    }

    /// Copy of the job without its transient secrets, as it may be persisted.
    pub fn without_secrets(&self) -> Self {
        Self {
            credentials: None,
            email: None,
            ..self.clone()
        }
    }
}

/// A job looping reconciliation passes until terminated.
///
/// At most one is active per subject key; the exclusive queue enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousJob {
    /// Job id.
    pub id: JobId,
    /// Last time the job was persisted.
    pub last_update: DateTime<Utc>,
    /// Current state.
    pub state: JobState,
    /// The subject being watched.
    pub subject: Subject,
    /// Credentials, kept until the job terminates so it can be resumed.
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Contact address for notifications.
    pub email: Option<String>,
    /// Marks a request to stop the subject's running job.
    #[serde(skip)]
    pub terminate: bool,
    #[serde(skip)]
    pub(crate) cancel: Option<CancellationToken>,
}

impl ContinuousJob {
    /// Creates a pending job.
    pub fn new(
        subject: Subject,
        credentials: Credentials,
        email: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_update: now,
            state: JobState::Pending,
            subject,
            credentials: Some(credentials),
            email: Some(email.into()),
            terminate: false,
            cancel: None,
        }
    }

    /// A request to stop whatever continuous job is active for `user_id`.
    pub fn terminator(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_update: DateTime::<Utc>::default(),
            state: JobState::Pending,
            subject: Subject {
                user_id: user_id.into(),
                ..Subject::default()
            },
            credentials: None,
            email: None,
            terminate: true,
            cancel: None,
        }
    }

    /// Key partitioning exclusivity.
    pub fn subject_key(&self) -> &str {
        &self.subject.user_id
    }

    /// Per-subject cancellation handle attached at enqueue time.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Moves the job to `next` and stamps it.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.last_update = now;
    }

    /// Drops credentials and contact address.
    pub fn scrub(&mut self) {
        self.credentials = None;
        self.email = None;
    }

    /// True if the job has not been updated for more than 30 minutes.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_update > Duration::minutes(CONTINUOUS_STALE_AFTER_MINS)
    }
}

/// Watch-list category of a relationship holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Category {
    /// No category assigned.
    #[default]
    Unspecified,
    /// Elected politicians and parties.
    Politician,
    /// Communications and PR professionals.
    Spin,
    /// Journalists.
    Journalist,
    /// Interest organisations.
    Lobby,
    /// Companies and executives.
    Business,
    /// Trade unions.
    Union,
    /// Public authorities.
    Public,
}

/// A watch-list member that may hold a block against the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Remote id of the member.
    pub external_id: String,
    /// Display name of the member.
    pub screen_name: String,
    /// Category of the list the member was first found on.
    pub category: Category,
}

/// A block currently held against a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Row id.
    pub id: Uuid,
    /// Local id of the blocked subject.
    pub subject_id: String,
    /// Remote id of the account holding the block.
    pub holder_id: String,
    /// When the block was first observed.
    pub first_seen: DateTime<Utc>,
    /// Last pass that confirmed the block.
    pub checked: DateTime<Utc>,
}

impl Block {
    /// A block observed for the first time at `now`.
    pub fn observed(
        subject_id: impl Into<String>,
        holder_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            holder_id: holder_id.into(),
            first_seen: now,
            checked: now,
        }
    }
}

/// A block that is no longer observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedBlock {
    /// Row id.
    pub id: Uuid,
    /// Local id of the subject.
    pub subject_id: String,
    /// Remote id of the account that held the block.
    pub holder_id: String,
    /// Copied from the archived block.
    pub first_seen: DateTime<Utc>,
    /// Copied from the archived block.
    pub checked: DateTime<Utc>,
    /// When the block was found to be gone.
    pub verified_gone: DateTime<Utc>,
}

impl ArchivedBlock {
    /// Archives `block` as gone at `now`.
    pub fn from_block(block: &Block, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: block.subject_id.clone(),
            holder_id: block.holder_id.clone(),
            first_seen: block.first_seen,
            checked: block.checked,
            verified_gone: now,
        }
    }
}
