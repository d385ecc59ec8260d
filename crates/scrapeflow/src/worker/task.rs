use std::time::Duration;

use crate::config::{JobId, JobSpecification, RetryConfig};
use crate::pipeline::{ArchiveRequest, ArchiveSettings, PersistOutcome, ScrapeOutcome, UploadOutcome};

/// How often a persistence unit is attempted before the run is failed.
#[derive(Debug, Clone, Copy)]
pub struct PersistRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl PersistRetry {
    pub fn from_config(retry: &RetryConfig) -> Self {
        Self {
            attempts: retry.persist_retries.max(1),
            delay: Duration::from_secs(retry.persist_retry_delay_secs),
        }
    }

    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistTask {
    pub batch_id: String,
    pub run_id: String,
    pub job: JobSpecification,
    pub outcome: ScrapeOutcome,
    pub retry: PersistRetry,
}

#[derive(Debug, Clone)]
pub struct ArchiveTask {
    pub batch_id: String,
    pub request: ArchiveRequest,
    pub settings: ArchiveSettings,
}

/// A unit of work executed to completion by one worker.
#[derive(Debug, Clone)]
pub enum Task {
    Persist(PersistTask),
    Archive(ArchiveTask),
}

impl Task {
    pub fn batch_id(&self) -> &str {
        match self {
            Task::Persist(task) => &task.batch_id,
            Task::Archive(task) => &task.batch_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Persist(_) => "persist",
            Task::Archive(_) => "archive",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskResult {
    Persisted {
        batch_id: String,
        run_id: String,
        job_id: JobId,
        attempts: u32,
        result: Result<PersistOutcome, String>,
    },
    Archived {
        batch_id: String,
        outcome: UploadOutcome,
    },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        match self {
            TaskResult::Persisted { result, .. } => result.is_ok(),
            TaskResult::Archived { outcome, .. } => outcome.is_success(),
        }
    }
}
