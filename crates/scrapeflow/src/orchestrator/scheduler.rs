//! Time-based triggers and run-level retries.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ExecutionKind, JobId, Schedule};
use crate::orchestrator::{JobSelection, Orchestrator, OrchestratorError, RunSummary};

/// Runs an invocation and retries its failed jobs.
///
/// Only jobs that failed with a retryable error are attempted again, each
/// retry re-reading the configuration so switch and job edits apply. A
/// configuration error on the first attempt is returned; on a later attempt
/// it ends the retries and the summary so far is returned.
pub fn run_with_retry(
    orchestrator: &Orchestrator,
    kind: ExecutionKind,
    job_id: Option<&JobId>,
) -> Result<RunSummary, OrchestratorError> {
    let mut summary = orchestrator.run_schedule(kind, job_id)?;
    let mut attempt = 0;

    loop {
        let failed = summary.retryable_jobs();
        if failed.is_empty() {
            break;
        }

        let retry = orchestrator.provider().current().retry.clone();
        if attempt >= retry.max_retries {
            warn!(
                "Giving up on {} job(s) after {} retries",
                failed.len(),
                retry.max_retries
            );
            break;
        }
        attempt += 1;

        info!(
            "Retrying {} failed job(s) in {}s (attempt {}/{})",
            failed.len(),
            retry.retry_delay_secs,
            attempt,
            retry.max_retries
        );
        std::thread::sleep(Duration::from_secs(retry.retry_delay_secs));

        match orchestrator.run_selection(kind, &JobSelection::Only(failed.clone()), attempt) {
            Ok(next) => summary.merge_retry(&failed, next),
            Err(e @ OrchestratorError::Config(_)) => {
                error!("Configuration error during retry, stopping: {}", e);
                break;
            }
            Err(e) if e.is_retryable() => {
                warn!("Retry attempt {} failed: {}", attempt, e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}

/// Registers every scheduled job that has a trigger and fires it through
/// [`run_with_retry`] on the blocking thread pool.
pub struct ScheduleHost {
    scheduler: JobScheduler,
    orchestrator: Arc<Orchestrator>,
    registered: Vec<(JobId, Uuid)>,
}

impl ScheduleHost {
    pub async fn start(orchestrator: Arc<Orchestrator>) -> Result<Self, OrchestratorError> {
        let scheduler = JobScheduler::new().await?;
        let mut host = Self {
            scheduler,
            orchestrator,
            registered: Vec::new(),
        };
        host.register_all().await?;
        host.scheduler.start().await?;
        info!("Schedule host started with {} trigger(s)", host.registered.len());
        Ok(host)
    }

    pub fn registered(&self) -> Vec<JobId> {
        self.registered.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Drops all triggers and registers them again from a freshly loaded
    /// configuration. The previous triggers stay when the reload fails.
    pub async fn refresh(&mut self) -> Result<usize, OrchestratorError> {
        self.orchestrator.provider().reload()?;
        for (job_id, uuid) in std::mem::take(&mut self.registered) {
            if let Err(e) = self.scheduler.remove(&uuid).await {
                warn!(job_id = %job_id, "Failed to remove trigger: {}", e);
            }
        }
        self.register_all().await?;
        Ok(self.registered.len())
    }

    async fn register_all(&mut self) -> Result<(), OrchestratorError> {
        let config = self.orchestrator.provider().current();
        for job in config.jobs.for_kind(ExecutionKind::Scheduled) {
            let Some(schedule) = &job.schedule else {
                continue;
            };
            let job_id = job.job_id();
            let trigger = trigger_for(Arc::clone(&self.orchestrator), job_id.clone(), schedule)?;
            let uuid = self.scheduler.add(trigger).await?;
            info!(job_id = %job_id, label = %job.label(), "Registered trigger {:?}", schedule);
            self.registered.push((job_id, uuid));
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<Arc<Orchestrator>, OrchestratorError> {
        self.scheduler.shutdown().await?;
        info!("Schedule host stopped");
        Ok(self.orchestrator)
    }
}

fn trigger_for(
    orchestrator: Arc<Orchestrator>,
    job_id: JobId,
    schedule: &Schedule,
) -> Result<Job, OrchestratorError> {
    let job = match schedule {
        Schedule::Cron(expression) => Job::new_async(expression.as_str(), move |_uuid, _lock| {
            let orchestrator = Arc::clone(&orchestrator);
            let job_id = job_id.clone();
            Box::pin(async move { fire(orchestrator, job_id).await })
        })?,
        Schedule::Interval { every_secs } => {
            Job::new_repeated_async(Duration::from_secs((*every_secs).max(1)), move |_uuid, _lock| {
                let orchestrator = Arc::clone(&orchestrator);
                let job_id = job_id.clone();
                Box::pin(async move { fire(orchestrator, job_id).await })
            })?
        }
    };
    Ok(job)
}

async fn fire(orchestrator: Arc<Orchestrator>, job_id: JobId) {
    let id = job_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        run_with_retry(&orchestrator, ExecutionKind::Scheduled, Some(&id))
    })
    .await;

    match result {
        Ok(Ok(summary)) => info!(
            job_id = %job_id,
            status = ?summary.status,
            reason = summary.reason.as_deref().unwrap_or(""),
            "Scheduled run finished"
        ),
        Ok(Err(e)) => error!(job_id = %job_id, "Scheduled run failed: {}", e),
        Err(e) => error!(job_id = %job_id, "Scheduled run panicked: {}", e),
    }
}
