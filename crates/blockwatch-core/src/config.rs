//! Runtime configuration for queues, gates, reconciliation and notifications.

use crate::error::{BlockwatchError, Result};
use crate::rate_gate::RateLimit;
use crate::watchlist::WatchedList;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound of the minute-valued thresholds: one year.
pub const MAX_THRESHOLD_MINS: u64 = 525_600;

/// Reads a `.toml` or `.json` file into `T`, chosen by extension.
///
/// Parsing only; callers validate the result.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => toml::from_str(&contents)
            .map_err(|e| BlockwatchError::invalid_config(e.to_string())),
        "json" => Ok(serde_json::from_str(&contents)?),
        _ => Err(BlockwatchError::invalid_config(format!(
            "unsupported config file extension: {}",
            ext
        ))),
    }
}

fn minutes(value: u64) -> chrono::Duration {
    let clamped = i64::try_from(value.min(MAX_THRESHOLD_MINS)).unwrap_or_default();
    chrono::Duration::minutes(clamped)
}

/// Occurrences allowed per window, as written in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions per window.
    pub occurrences: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// The limit as used by a rate gate.
    pub fn to_limit(&self) -> RateLimit {
        RateLimit::new(self.occurrences, Duration::from_secs(self.window_secs))
    }
}

/// Links embedded in notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    /// Page listing the subject's blocks.
    pub blocks_url: String,
    /// Page where the subject re-authorizes.
    pub login_url: String,
    /// Landing page.
    pub home_url: String,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            blocks_url: String::from("https://polcensur.dk/profile/blocks"),
            login_url: String::from("https://polcensur.dk/login"),
            home_url: String::from("https://polcensur.dk"),
        }
    }
}

/// Configuration of the blockwatch runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockwatchConfig {
    /// Capacity of the one-shot check queue (queued plus in flight).
    pub check_queue_capacity: usize,
    /// Capacity of the continuous queue (queued plus in flight).
    pub continuous_queue_capacity: usize,
    /// Minimum spacing of passes within one continuous job.
    pub pass_interval_secs: u64,
    /// Window over which resumed jobs are re-admitted at startup.
    pub reload_spread_secs: u64,
    /// A block reappearing within this many minutes of being archived is not announced.
    pub dedup_threshold_mins: u64,
    /// A non-terminal one-shot job older than this no longer blocks a new one.
    pub stale_job_mins: u64,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace_secs: u64,
    /// Relationship checks per subject.
    pub verify_limit: RateLimitConfig,
    /// Watch-list member listings, application wide.
    pub list_limit: RateLimitConfig,
    /// Lists whose members are checked.
    pub watch_lists: Vec<WatchedList>,
    /// Links embedded in notifications.
    pub links: Links,
}

impl Default for BlockwatchConfig {
    fn default() -> Self {
        Self {
            check_queue_capacity: 50,
            continuous_queue_capacity: 100,
            pass_interval_secs: 600,
            reload_spread_secs: 600,
            dedup_threshold_mins: 90,
            stale_job_mins: 120,
            shutdown_grace_secs: 30,
            verify_limit: RateLimitConfig {
                occurrences: 900,
                window_secs: 900,
            },
            list_limit: RateLimitConfig {
                occurrences: 75,
                window_secs: 900,
            },
            watch_lists: Vec::new(),
            links: Links::default(),
        }
    }
}

impl BlockwatchConfig {
    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.check_queue_capacity == 0 || self.continuous_queue_capacity == 0 {
            return Err(BlockwatchError::invalid_config(
                "queue capacities must be positive",
            ));
        }
        if self.pass_interval_secs == 0 || self.reload_spread_secs == 0 {
            return Err(BlockwatchError::invalid_config(
                "pass interval and reload spread must be positive",
            ));
        }
        if self.dedup_threshold_mins > MAX_THRESHOLD_MINS || self.stale_job_mins > MAX_THRESHOLD_MINS {
            return Err(BlockwatchError::invalid_config(format!(
                "dedup_threshold_mins and stale_job_mins must not exceed {}",
                MAX_THRESHOLD_MINS
            )));
        }
        self.verify_limit.to_limit().validate()?;
        self.list_limit.to_limit().validate()?;
        Ok(())
    }

    /// Minimum spacing of passes within one continuous job.
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }

    /// Window over which resumed jobs are re-admitted.
    pub fn reload_spread(&self) -> Duration {
        Duration::from_secs(self.reload_spread_secs)
    }

    /// Notification dedup threshold.
    pub fn dedup_threshold(&self) -> chrono::Duration {
        minutes(self.dedup_threshold_mins)
    }

    /// Staleness threshold of one-shot jobs.
    pub fn stale_job_after(&self) -> chrono::Duration {
        minutes(self.stale_job_mins)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
