use serde::Serialize;

use crate::config::{ExecutionKind, JobId};
use crate::pipeline::{ScrapeOutcome, ScrapeStatus, UploadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Completed,
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub label: String,
    pub run_id: Option<String>,
    pub status: ScrapeStatus,
    pub reason: Option<String>,
    pub retryable: bool,
    pub items_found: u64,
    pub child_items_scraped: u64,
    pub child_items_failed: u64,
    pub artifact_path: Option<String>,
    pub attempt: u32,
}

impl JobSummary {
    pub fn skipped(job_id: JobId, label: String, run_id: Option<String>, reason: &str, attempt: u32) -> Self {
        Self {
            job_id,
            label,
            run_id,
            status: ScrapeStatus::Skipped,
            reason: Some(reason.to_string()),
            retryable: false,
            items_found: 0,
            child_items_scraped: 0,
            child_items_failed: 0,
            artifact_path: None,
            attempt,
        }
    }

    pub fn from_outcome(label: String, run_id: String, outcome: &ScrapeOutcome, attempt: u32) -> Self {
        Self {
            job_id: outcome.job_id.clone(),
            label,
            run_id: Some(run_id),
            status: outcome.status,
            reason: outcome.error.clone(),
            retryable: outcome.retryable,
            items_found: outcome.items_found,
            child_items_scraped: outcome.child_items_scraped,
            child_items_failed: outcome.child_items_failed,
            artifact_path: outcome.artifact_path.as_ref().map(|p| p.display().to_string()),
            attempt,
        }
    }

    pub fn needs_retry(&self) -> bool {
        self.status == ScrapeStatus::Failed && self.retryable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub items_found: u64,
    pub child_items_scraped: u64,
    pub child_items_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub batch_id: String,
    pub dispatched: bool,
    /// Present when the archive ran synchronously.
    pub outcome: Option<UploadOutcome>,
}

/// Result of one orchestrator invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub kind: ExecutionKind,
    pub status: SummaryStatus,
    pub reason: Option<String>,
    pub attempts: u32,
    pub jobs: Vec<JobSummary>,
    pub totals: Totals,
    pub archive: Option<ArchiveSummary>,
}

impl RunSummary {
    pub fn skipped(run_id: String, kind: ExecutionKind, reason: &str) -> Self {
        Self {
            run_id,
            kind,
            status: SummaryStatus::Skipped,
            reason: Some(reason.to_string()),
            attempts: 1,
            jobs: Vec::new(),
            totals: Totals::default(),
            archive: None,
        }
    }

    /// Recomputes totals and the overall status from `jobs`.
    pub fn finalize(&mut self) {
        let mut totals = Totals::default();
        for job in &self.jobs {
            totals.jobs += 1;
            match job.status {
                ScrapeStatus::Success => totals.succeeded += 1,
                ScrapeStatus::Failed => totals.failed += 1,
                ScrapeStatus::Skipped => totals.skipped += 1,
            }
            totals.items_found += job.items_found;
            totals.child_items_scraped += job.child_items_scraped;
            totals.child_items_failed += job.child_items_failed;
        }

        self.status = match (totals.succeeded, totals.failed) {
            (0, 0) => SummaryStatus::Skipped,
            (_, 0) => SummaryStatus::Completed,
            (0, _) => SummaryStatus::Failed,
            _ => SummaryStatus::Partial,
        };
        if self.status == SummaryStatus::Skipped && self.reason.is_none() {
            let reasons: Vec<&str> = self.jobs.iter().filter_map(|j| j.reason.as_deref()).collect();
            self.reason = Some(match reasons.as_slice() {
                [] => "no_jobs".to_string(),
                [first, rest @ ..] if rest.iter().all(|r| r == first) => first.to_string(),
                _ => "jobs_skipped".to_string(),
            });
        }
        self.totals = totals;
    }

    /// Jobs worth another attempt.
    pub fn retryable_jobs(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|job| job.needs_retry())
            .map(|job| job.job_id.clone())
            .collect()
    }

    /// Folds a retry attempt into this summary. Retried jobs missing from
    /// `retry` (for example because a switch turned off) become skipped.
    pub fn merge_retry(&mut self, retried: &[JobId], retry: RunSummary) {
        self.attempts += 1;
        for job_id in retried {
            let replacement = retry.jobs.iter().find(|job| &job.job_id == job_id).cloned();
            if let Some(slot) = self.jobs.iter_mut().find(|job| &job.job_id == job_id) {
                *slot = match replacement {
                    Some(job) => job,
                    None => JobSummary {
                        status: ScrapeStatus::Skipped,
                        retryable: false,
                        reason: Some(retry.reason.clone().unwrap_or_else(|| "job_not_found".to_string())),
                        ..slot.clone()
                    },
                };
            }
        }
        if retry.archive.is_some() {
            self.archive = retry.archive;
        }
        self.reason = None;
        self.finalize();
    }
}
