#![warn(missing_docs)]

//! Blockwatch core: finds out who blocks a subject and keeps that record current.
//!
//! Check path:      submit → BoundedJobQueue → CheckJobProcessor → one reconciliation pass
//! Continuous path: start → ExclusiveContinuousQueue → ContinuousJobProcessor → pass every interval
//! Both passes go through RateLimitedClient, whose gates bound calls to the remote API.

pub mod cancel;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exclusive;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod rate_gate;
pub mod reconcile;
pub mod reloader;
pub mod sealing;
pub mod service;
pub mod store;
pub mod types;
pub mod watchlist;

#[cfg(test)]
mod testing;

pub use cancel::{CancelSource, LinkedCancellation};
pub use client::{ListMember, RateLimitedClient, RelationshipClient};
pub use clock::{Clock, SystemClock};
pub use config::{BlockwatchConfig, Links, RateLimitConfig};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherHandle};
pub use error::{BlockwatchError, Result};
pub use exclusive::{Admission, ExclusiveContinuousQueue};
pub use notify::{ExceptionLogger, ExceptionRecord, Notifier, Template, TemplateParams, TracingNotifier};
pub use processor::{CheckJobProcessor, ContinuousJobProcessor, JobProcessor, ProcessorContext};
pub use queue::{BoundedJobQueue, Dequeued, JobQueue, Release};
pub use rate_gate::{KeyedRateGate, RateGate, RateLimit};
pub use reconcile::{PassOutcome, ReconciliationEngine};
pub use reloader::JobReloader;
pub use sealing::{CredentialSealer, MasterKey, SealedCredentials};
pub use service::{Blockwatch, Collaborators, ServiceStats};
pub use store::{BlockChanges, BlockStore, JobStore, MemoryStore, StoreSnapshot};
pub use types::{
    ArchivedBlock, Block, Candidate, Category, CheckJob, ContinuousJob, Credentials, JobId,
    JobState, Subject,
};
pub use watchlist::{CandidateProvider, CandidateSource, StaticCandidates, WatchedList};
