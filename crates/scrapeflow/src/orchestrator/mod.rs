//! Resolves which jobs run, drives them one after another, and hands the
//! persistence and archive work to the worker pool.
//!
//! Every invocation re-reads the configuration first and then walks the
//! switch cascade: master switch, capability switch for the execution kind,
//! then each job's own `enabled` flag. The outcome of the walk is always a
//! [`RunSummary`], including when nothing was allowed to run.

pub mod scheduler;
pub mod summary;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::config::{Config, ConfigProvider, ExecutionKind, JobId, JobSpecification};
use crate::db::run_repo::{self, NewRun, RunCompletion, RunStatus};
use crate::db::{Database, DatabaseError};
use crate::error::{ConfigError, WorkerError};
use crate::pipeline::{
    batch_directory, stage_artifacts, ArchiveRequest, ArchiveSettings, JobProcessor, ScrapeOutcome,
    ScrapeStatus,
};
use crate::scraper::ScrapeRunner;
use crate::storage::ObjectStore;
use crate::worker::{ArchiveTask, PersistRetry, PersistTask, Task, TaskResult, WorkerContext, WorkerPool};

pub use scheduler::{run_with_retry, ScheduleHost};
pub use summary::{ArchiveSummary, JobSummary, RunSummary, SummaryStatus, Totals};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Database(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Which jobs of an execution kind an invocation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelection {
    All,
    One(JobId),
    /// Used for retries: only these jobs, looked up in the fresh config.
    Only(Vec<JobId>),
}

impl JobSelection {
    fn resolve<'a>(&self, config: &'a Config, kind: ExecutionKind) -> Vec<Result<&'a JobSpecification, JobId>> {
        let jobs = &config.jobs;
        match self {
            JobSelection::All => jobs.for_kind(kind).iter().map(Ok).collect(),
            JobSelection::One(id) => vec![jobs.find(kind, id).ok_or_else(|| id.clone())],
            JobSelection::Only(ids) => ids
                .iter()
                .map(|id| jobs.find(kind, id).ok_or_else(|| id.clone()))
                .collect(),
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ConfigProvider>,
    db: Database,
    runner: Arc<dyn ScrapeRunner>,
    pool: WorkerPool,
}

impl Orchestrator {
    /// Starts the worker pool sized from the current configuration.
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        db: Database,
        runner: Arc<dyn ScrapeRunner>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let worker_count = provider.current().worker_count.max(1);
        let context = WorkerContext {
            db: db.clone(),
            store,
        };
        let pool = WorkerPool::new(context, worker_count);

        Self {
            provider,
            db,
            runner,
            pool,
        }
    }

    pub fn provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.provider
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Blocks until queued persistence and archive work is done.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Runs every job of `kind`, or only `job_id` when given.
    pub fn run_schedule(
        &self,
        kind: ExecutionKind,
        job_id: Option<&JobId>,
    ) -> Result<RunSummary, OrchestratorError> {
        let selection = match job_id {
            Some(id) => JobSelection::One(id.clone()),
            None => JobSelection::All,
        };
        self.run_selection(kind, &selection, 0)
    }

    pub fn run_selection(
        &self,
        kind: ExecutionKind,
        selection: &JobSelection,
        attempt: u32,
    ) -> Result<RunSummary, OrchestratorError> {
        let config = self.provider.reload()?;
        let batch_id = uuid::Uuid::new_v4().to_string();
        let _span = info_span!("orchestrate", %kind, batch_id = %batch_id, attempt).entered();

        if !config.switches.master_enabled {
            info!("Master switch is off; skipping {} run", kind);
            return Ok(RunSummary::skipped(batch_id, kind, "globally_disabled"));
        }
        if !config.switches.capability_enabled(kind) {
            let reason = match kind {
                ExecutionKind::Scheduled => "scheduled_disabled",
                ExecutionKind::Manual => "manual_disabled",
            };
            info!("{} runs are disabled; skipping", kind);
            return Ok(RunSummary::skipped(batch_id, kind, reason));
        }

        let processor = JobProcessor::new(
            Arc::clone(&self.runner),
            config.scraper.clone(),
            config.switches.child_scraping_enabled,
        );
        let archive = self.archive_settings(&config);
        let batch_dir = archive.as_ref().and_then(|_| {
            config
                .archive
                .staging_directory
                .as_ref()
                .map(|root| batch_directory(&PathBuf::from(root), &batch_id))
        });
        let persist_retry = PersistRetry::from_config(&config.retry);

        let mut summary = RunSummary::skipped(batch_id.clone(), kind, "no_jobs");
        summary.reason = None;
        summary.attempts = attempt + 1;

        let mut archived_jobs = Vec::new();
        let mut item_counts: BTreeMap<String, u64> = BTreeMap::new();

        for resolved in selection.resolve(&config, kind) {
            let job = match resolved {
                Ok(job) => job,
                Err(missing) => {
                    warn!(job_id = %missing, "Job is no longer configured");
                    summary.jobs.push(JobSummary::skipped(
                        missing.clone(),
                        missing.to_string(),
                        None,
                        "job_not_found",
                        attempt,
                    ));
                    continue;
                }
            };

            if !job.enabled {
                let run_id = run_repo::record_skipped(&self.db, &NewRun::for_job(job, kind, attempt), "job_disabled")?;
                summary.jobs.push(JobSummary::skipped(
                    job.job_id(),
                    job.label(),
                    Some(run_id),
                    "job_disabled",
                    attempt,
                ));
                continue;
            }

            let run_id = run_repo::begin(&self.db, &NewRun::for_job(job, kind, attempt))?;
            let outcome = processor.run(job);
            summary
                .jobs
                .push(JobSummary::from_outcome(job.label(), run_id.clone(), &outcome, attempt));

            match outcome.status {
                ScrapeStatus::Success => {
                    if let Some(dir) = &batch_dir {
                        if self.stage(&processor, dir, &outcome) {
                            archived_jobs.push(job.clone());
                            *item_counts.entry(job.name.clone()).or_default() += outcome.items_found;
                        }
                    }
                    self.pool.submit(Task::Persist(PersistTask {
                        batch_id: batch_id.clone(),
                        run_id,
                        job: job.clone(),
                        outcome,
                        retry: persist_retry,
                    }))?;
                }
                ScrapeStatus::Failed | ScrapeStatus::Skipped => self.close_run(&run_id, &outcome)?,
            }
        }

        if let (Some(settings), Some(dir)) = (archive, batch_dir) {
            if !archived_jobs.is_empty() {
                let mut metadata = BTreeMap::new();
                metadata.insert("batch_id".to_string(), batch_id.clone());
                metadata.insert("kind".to_string(), kind.to_string());
                metadata.insert("attempt".to_string(), attempt.to_string());

                let task = ArchiveTask {
                    batch_id: batch_id.clone(),
                    request: ArchiveRequest {
                        kind,
                        source_directory: dir,
                        jobs: archived_jobs,
                        item_counts,
                        metadata,
                        created_at: Local::now(),
                    },
                    settings,
                };
                summary.archive = Some(self.dispatch_archive(&batch_id, task, config.archive.synchronous)?);
            }
        }

        summary.finalize();
        info!(
            status = ?summary.status,
            succeeded = summary.totals.succeeded,
            failed = summary.totals.failed,
            skipped = summary.totals.skipped,
            "{} run finished",
            kind
        );
        Ok(summary)
    }

    fn archive_settings(&self, config: &Config) -> Option<ArchiveSettings> {
        if !config.switches.archive_enabled {
            return None;
        }
        let settings = ArchiveSettings::from_config(config);
        if settings.is_none() {
            warn!("Archiving is enabled but no staging directory is configured");
        }
        settings
    }

    /// Copies a job's artifacts into the batch directory. Returns whether
    /// anything was staged.
    fn stage(&self, processor: &JobProcessor, batch_dir: &std::path::Path, outcome: &ScrapeOutcome) -> bool {
        match stage_artifacts(processor.locator().scrapes_dir(), batch_dir, outcome.artifact_paths()) {
            Ok(staged) => !staged.is_empty(),
            Err(e) => {
                warn!(job_id = %outcome.job_id, error = %e, "Could not stage artifacts for archiving");
                false
            }
        }
    }

    fn close_run(&self, run_id: &str, outcome: &ScrapeOutcome) -> Result<(), OrchestratorError> {
        let status = match outcome.status {
            ScrapeStatus::Skipped => RunStatus::Skipped,
            _ => RunStatus::Failed,
        };
        let completion = RunCompletion {
            status,
            items_found: outcome.items_found,
            items_persisted: 0,
            children_persisted: 0,
            artifact_path: outcome.artifact_path.as_ref().map(|p| p.display().to_string()),
            error_message: outcome.error.clone(),
        };
        run_repo::finish(&self.db, run_id, &completion)?;
        Ok(())
    }

    fn dispatch_archive(
        &self,
        batch_id: &str,
        task: ArchiveTask,
        synchronous: bool,
    ) -> Result<ArchiveSummary, OrchestratorError> {
        if !synchronous {
            self.pool.submit(Task::Archive(task))?;
            return Ok(ArchiveSummary {
                batch_id: batch_id.to_string(),
                dispatched: true,
                outcome: None,
            });
        }

        let reply = self.pool.submit_with_reply(Task::Archive(task))?;
        let outcome = match reply.recv() {
            Ok(TaskResult::Archived { outcome, .. }) => Some(outcome),
            Ok(other) => {
                error!("Unexpected reply to archive task: {:?}", other);
                None
            }
            Err(_) => return Err(WorkerError::ChannelClosed.into()),
        };
        Ok(ArchiveSummary {
            batch_id: batch_id.to_string(),
            dispatched: true,
            outcome,
        })
    }

    /// Stops accepting work, lets queued tasks finish and joins the workers.
    pub fn shutdown(self) {
        self.pool.wait();
    }
}
