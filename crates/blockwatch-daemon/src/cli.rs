//! Command line of `blockwatchd`.

use crate::config::DaemonConfig;
use crate::file_store::FileStore;
use crate::http_client::HttpRelationshipClient;
use anyhow::{Context, Result};
use blockwatch_core::{
    BlockStore, Blockwatch, Collaborators, ContinuousJob, CredentialSealer, Credentials, JobState,
    JobStore, Subject, SystemClock, TracingNotifier,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CHECK_POLL: Duration = Duration::from_millis(250);

/// Command line of `blockwatchd`.
#[derive(Parser)]
#[command(name = "blockwatchd")]
#[command(about = "Watches who blocks a subject and keeps the record current", long_about = None)]
pub struct Cli {
    /// Config file (`.toml` or `.json`).
    #[arg(short, long, global = true, env = "BLOCKWATCH_CONFIG", default_value = "/etc/blockwatch/blockwatch.toml")]
    pub config: PathBuf,

    /// Application bearer token, overriding the config file.
    #[arg(long, global = true, env = "BLOCKWATCH_APP_TOKEN")]
    pub app_token: Option<String>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run until interrupted, resuming persisted continuous jobs.
    Serve,
    /// List persisted continuous jobs.
    Jobs {
        /// Include completed and failed jobs.
        #[arg(short, long)]
        all: bool,
    },
    /// Validate the config file and print a summary.
    CheckConfig,
    /// Run one reconciliation pass for a subject and print its blocks.
    Check(SubjectArgs),
    /// Persist a continuous job; the next `serve` picks it up.
    Watch(SubjectArgs),
    /// Close the subject's persisted continuous job. Only while the daemon is stopped.
    Unwatch {
        /// Local id of the subject.
        user_id: String,
    },
}

/// The subject a job runs for.
#[derive(Args, Clone)]
pub struct SubjectArgs {
    /// Local account id.
    #[arg(long)]
    pub user_id: String,
    /// Remote account id.
    #[arg(long)]
    pub external_id: String,
    /// Remote display name.
    #[arg(long)]
    pub screen_name: String,
    /// Access token granted by the subject.
    #[arg(long, env = "BLOCKWATCH_ACCESS_TOKEN")]
    pub access_token: String,
    /// Access token secret granted by the subject.
    #[arg(long, env = "BLOCKWATCH_ACCESS_TOKEN_SECRET")]
    pub access_token_secret: String,
    /// Notification address; empty disables notifications.
    #[arg(long, default_value = "")]
    pub email: String,
}

impl SubjectArgs {
    fn subject(&self) -> Subject {
        Subject::new(&self.user_id, &self.external_id, &self.screen_name)
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(&self.access_token, &self.access_token_secret)
    }
}

impl Cli {
    /// Runs the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve => self.serve().await,
            Command::Jobs { all } => self.jobs(all).await,
            Command::CheckConfig => self.check_config(),
            Command::Check(ref args) => self.check(args).await,
            Command::Watch(ref args) => self.watch(args).await,
            Command::Unwatch { ref user_id } => self.unwatch(user_id).await,
        }
    }

    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = if self.config.exists() {
            DaemonConfig::from_file(&self.config)
                .with_context(|| format!("loading {}", self.config.display()))?
        } else {
            warn!("Config file not found, using defaults: {}", self.config.display());
            DaemonConfig::default()
        };
        if let Some(token) = &self.app_token {
            config.app_bearer_token = Some(token.clone());
        }
        Ok(config)
    }

    async fn open_store(config: &DaemonConfig) -> Result<Arc<FileStore>> {
        let sealer = config.sealing_key()?.map(CredentialSealer::new);
        let store = FileStore::open(&config.store_path, sealer)
            .await
            .with_context(|| format!("opening store {}", config.store_path.display()))?;
        Ok(Arc::new(store))
    }

    fn start(config: &DaemonConfig, store: Arc<FileStore>) -> Result<Blockwatch> {
        let client = HttpRelationshipClient::new(
            config.api_base_url.clone(),
            config.app_bearer_token.clone(),
            HTTP_TIMEOUT,
        )?;
        let collaborators = Collaborators {
            jobs: store.clone(),
            blocks: store.clone(),
            client: Arc::new(client),
            notifier: Arc::new(TracingNotifier),
            exceptions: store,
            clock: Arc::new(SystemClock),
            candidates: None,
        };
        Ok(Blockwatch::start(config.core.clone(), collaborators)?)
    }

    async fn serve(&self) -> Result<()> {
        let config = self.load_config()?;
        let store = Self::open_store(&config).await?;
        let service = Self::start(&config, store.clone())?;

        tokio::signal::ctrl_c()
            .await
            .context("waiting for interrupt")?;
        info!("interrupt received");

        let drained = service.shutdown().await;
        store.flush().await?;
        if !drained {
            warn!("some jobs were still running at exit");
        }
        Ok(())
    }

    async fn jobs(&self, all: bool) -> Result<()> {
        let config = self.load_config()?;
        let store = Self::open_store(&config).await?;
        let now = Utc::now();

        println!("{:<38} {:<20} {:<10} {:<26} {:<6}", "JOB ID", "SUBJECT", "STATE", "LAST UPDATE", "STALE");
        println!("{}", "-".repeat(104));
        for job in store.continuous_jobs().await? {
            if !all && job.state.is_terminal() {
                continue;
            }
            println!(
                "{:<38} {:<20} {:<10} {:<26} {:<6}",
                job.id.to_string(),
                job.subject.user_id,
                job.state.to_string(),
                job.last_update.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                if job.is_stale(now) { "yes" } else { "no" }
            );
        }
        Ok(())
    }

    fn check_config(&self) -> Result<()> {
        let config = DaemonConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        println!("Config OK: {}", self.config.display());
        println!("Store: {}", config.store_path.display());
        println!("API: {}", config.api_base_url);
        println!("Watch-lists: {}", config.core.watch_lists.len());
        println!(
            "Queues: check {} / continuous {}",
            config.core.check_queue_capacity, config.core.continuous_queue_capacity
        );
        println!(
            "Credential sealing: {}",
            if config.sealing_key_hex.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    async fn check(&self, args: &SubjectArgs) -> Result<()> {
        let config = self.load_config()?;
        let store = Self::open_store(&config).await?;
        let service = Self::start(&config, store.clone())?;

        let Some(job_id) = service
            .submit_check(args.subject(), args.credentials(), args.email.clone())
            .await?
        else {
            anyhow::bail!("a check for {} is already under way", args.user_id);
        };

        let state = loop {
            tokio::time::sleep(CHECK_POLL).await;
            match store.latest_check_job(&args.user_id).await? {
                Some(job) if job.id == job_id && job.state.is_terminal() => break job.state,
                _ => {}
            }
        };
        service.shutdown().await;
        store.flush().await?;

        println!("Check {}: {}", job_id, state);
        for block in store.blocks_for(&args.user_id).await? {
            println!("{:<24} since {}", block.holder_id, block.first_seen.format("%Y-%m-%d %H:%M"));
        }
        if state == JobState::Failed {
            anyhow::bail!("check failed, see the log for details");
        }
        Ok(())
    }

    async fn watch(&self, args: &SubjectArgs) -> Result<()> {
        let config = self.load_config()?;
        if config.sealing_key_hex.is_none() {
            anyhow::bail!("continuous jobs need sealing_key_hex so credentials survive until `serve`");
        }
        let store = Self::open_store(&config).await?;
        if let Some(existing) = store
            .non_terminal_continuous_jobs()
            .await?
            .into_iter()
            .find(|j| j.subject_key() == args.user_id)
        {
            println!("Already watching {} (job {})", args.user_id, existing.id);
            return Ok(());
        }

        let job = ContinuousJob::new(args.subject(), args.credentials(), args.email.clone(), Utc::now());
        store.save_continuous_job(&job).await?;
        println!("Watching {} (job {})", args.user_id, job.id);
        Ok(())
    }

    async fn unwatch(&self, user_id: &str) -> Result<()> {
        let config = self.load_config()?;
        let store = Self::open_store(&config).await?;
        let mut closed = 0;
        for mut job in store.non_terminal_continuous_jobs().await? {
            if job.subject_key() != user_id {
                continue;
            }
            job.scrub();
            job.transition(JobState::Completed, Utc::now());
            store.save_continuous_job(&job).await?;
            closed += 1;
        }
        println!("Closed {} job(s) for {}", closed, user_id);
        Ok(())
    }
}
