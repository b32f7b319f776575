//! Outbound notifications and the exception log.

use crate::config::Links;
use crate::error::{BlockwatchError, Result};
use crate::types::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Context tag of exceptions raised by one-shot jobs.
pub const CHECK_JOB_CONTEXT: &str = "CheckJob";
/// Context tag of exceptions raised by continuous jobs.
pub const CONTINUOUS_JOB_CONTEXT: &str = "ContinuousJob";

/// Notification kinds sent to a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Template {
    /// A one-shot check finished.
    Completed,
    /// The subject's credentials were rejected; they must log in again.
    UnauthorizedError,
    /// A job failed for another reason.
    Failed,
    /// A continuous pass found new or vanished blocks.
    BlocksUpdated,
}

impl Template {
    /// Stable key used by renderers.
    pub fn key(&self) -> &'static str {
        match self {
            Template::Completed => "completed",
            Template::UnauthorizedError => "unauthorized-error",
            Template::Failed => "failed",
            Template::BlocksUpdated => "blocks-updated",
        }
    }

    /// The link a notification of this kind points to.
    pub fn link<'a>(&self, links: &'a Links) -> &'a str {
        match self {
            Template::Completed | Template::BlocksUpdated => &links.blocks_url,
            Template::UnauthorizedError => &links.login_url,
            Template::Failed => &links.home_url,
        }
    }

    /// Parameters for a notification to `screen_name`.
    pub fn params(&self, screen_name: &str, links: &Links) -> TemplateParams {
        TemplateParams {
            screen_name: screen_name.to_string(),
            link: self.link(links).to_string(),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParams {
    /// Display name of the subject.
    pub screen_name: String,
    /// Link relevant to the notification.
    pub link: String,
}

/// Delivers notifications to subjects.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Sends `template` to `address`.
    async fn send(&self, address: &str, template: Template, params: &TemplateParams) -> Result<()>;
}

/// Notifier that only records the dispatch in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, address: &str, template: Template, params: &TemplateParams) -> Result<()> {
        info!(
            template = %template,
            screen_name = %params.screen_name,
            link = %params.link,
            has_address = !address.is_empty(),
            "notification dispatched"
        );
        Ok(())
    }
}

/// A job failure as written to the exception log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    /// Job that raised the error.
    pub job_id: JobId,
    /// [`CHECK_JOB_CONTEXT`] or [`CONTINUOUS_JOB_CONTEXT`].
    pub context: String,
    /// Error kind, see [`BlockwatchError::kind`].
    pub error_type: String,
    /// Rendered error message.
    pub message: String,
    /// Extra data attached by the caller.
    pub payload: Option<serde_json::Value>,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ExceptionRecord {
    /// Builds a record for `error`.
    pub fn new(
        job_id: JobId,
        context: &str,
        error: &BlockwatchError,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            context: context.to_string(),
            error_type: error.kind().to_string(),
            message: error.to_string(),
            payload: None,
            timestamp,
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Persists exception records.
#[async_trait]
pub trait ExceptionLogger: Send + Sync + 'static {
    /// Stores `record`.
    async fn log(&self, record: ExceptionRecord) -> Result<()>;
}
