//! Executes one scrape job end to end: the parent scrape, artifact
//! discovery and the per-item child scrapes.
//!
//! Nothing here touches the database. The processor only reports what the
//! external tool produced; persistence happens later on a worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::{Category, DelayRange, JobId, JobSpecification, ScraperConfig};
use crate::scraper::{
    ArtifactLocator, ArtifactRequest, InvokeRequest, ParentArtifact, ScrapeCommand, ScrapeRunner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Success,
    Failed,
    Skipped,
}

/// A child artifact produced for one parent item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildArtifactRef {
    pub url: String,
    pub parent_key: String,
    pub artifact_path: PathBuf,
}

/// Result of [`JobProcessor::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub job_id: JobId,
    pub status: ScrapeStatus,
    pub subject: String,
    pub category: Category,
    pub items_found: u64,
    pub child_items_scraped: u64,
    pub child_items_failed: u64,
    pub artifact_path: Option<PathBuf>,
    pub children: Vec<ChildArtifactRef>,
    pub error: Option<String>,
    /// Whether a failed job is worth running again.
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScrapeOutcome {
    fn new(job: &JobSpecification, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id(),
            status: ScrapeStatus::Success,
            subject: job.name.clone(),
            category: job.category,
            items_found: 0,
            child_items_scraped: 0,
            child_items_failed: 0,
            artifact_path: None,
            children: Vec::new(),
            error: None,
            retryable: false,
            started_at,
            finished_at: started_at,
        }
    }

    fn fail(mut self, error: impl Into<String>, retryable: bool) -> Self {
        self.status = ScrapeStatus::Failed;
        self.error = Some(error.into());
        self.retryable = retryable;
        self.finished_at = Utc::now();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ScrapeStatus::Success
    }

    /// Every file this job left in the scrapes tree.
    pub fn artifact_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.artifact_path
            .iter()
            .chain(self.children.iter().map(|c| &c.artifact_path))
    }
}

pub struct JobProcessor {
    runner: Arc<dyn ScrapeRunner>,
    locator: ArtifactLocator,
    scraper: ScraperConfig,
    child_scraping_enabled: bool,
}

impl JobProcessor {
    pub fn new(
        runner: Arc<dyn ScrapeRunner>,
        scraper: ScraperConfig,
        child_scraping_enabled: bool,
    ) -> Self {
        Self {
            runner,
            locator: ArtifactLocator::from_config(&scraper),
            scraper,
            child_scraping_enabled,
        }
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn run(&self, job: &JobSpecification) -> ScrapeOutcome {
        let started_at = Utc::now();
        let start_date = Local::now().date_naive();
        let outcome = ScrapeOutcome::new(job, started_at);
        let _span = info_span!("scrape_job", job_id = %outcome.job_id, label = %job.label()).entered();

        if !job.enabled {
            let mut outcome = outcome;
            outcome.status = ScrapeStatus::Skipped;
            outcome.error = Some("job_disabled".to_string());
            return outcome;
        }

        let (command, request) = match ScrapeCommand::parent(&self.scraper, job).and_then(|cmd| {
            let request = ArtifactRequest::for_job(job)?;
            Ok((cmd, request))
        }) {
            Ok(pair) => pair,
            Err(e) => return outcome.fail(e.to_string(), false),
        };

        let invoke = match InvokeRequest::new(command, &self.scraper, job.options.auto_confirm) {
            Ok(invoke) => invoke,
            Err(e) => return outcome.fail(e.to_string(), false),
        };

        if let Err(e) = self.runner.run(&invoke) {
            warn!(error = %e, "Parent scrape failed");
            let retryable = e.is_retryable();
            return outcome.fail(e.to_string(), retryable);
        }

        let dates = candidate_dates(start_date);
        let Some(artifact_path) = self.locator.locate(&request, &dates) else {
            return outcome.fail("artifact not found", true);
        };

        let mut outcome = outcome;
        outcome.artifact_path = Some(artifact_path.clone());

        if request.csv {
            debug!("CSV artifact; item discovery and child scraping skipped");
            outcome.finished_at = Utc::now();
            return outcome;
        }

        let urls = match ParentArtifact::read(&artifact_path) {
            Ok(artifact) => {
                outcome.items_found = artifact.items.len() as u64;
                artifact
                    .parse_items()
                    .filter_map(|(_, item)| item.ok())
                    .filter_map(|item| {
                        let url = item.canonical_url()?;
                        Some((item.natural_key, url))
                    })
                    .collect::<Vec<_>>()
            }
            Err(e) => {
                // Persistence reports the malformed artifact against the run.
                warn!(error = %e, "Artifact unreadable; skipping child scrapes");
                Vec::new()
            }
        };

        if self.child_scraping_enabled && job.options.scrape_children {
            self.scrape_children(job, &urls, start_date, &mut outcome);
        } else {
            debug!("Child scraping disabled for this job");
        }

        outcome.finished_at = Utc::now();
        info!(
            items_found = outcome.items_found,
            children = outcome.child_items_scraped,
            child_failures = outcome.child_items_failed,
            "Scrape job finished"
        );
        outcome
    }

    fn scrape_children(
        &self,
        job: &JobSpecification,
        urls: &[(String, String)],
        start_date: NaiveDate,
        outcome: &mut ScrapeOutcome,
    ) {
        let last = urls.len().saturating_sub(1);
        for (index, (parent_key, url)) in urls.iter().enumerate() {
            let _span = info_span!("child_scrape", parent = %parent_key).entered();

            match self.scrape_child(job, url, start_date) {
                Ok(artifact_path) => {
                    outcome.child_items_scraped += 1;
                    outcome.children.push(ChildArtifactRef {
                        url: url.clone(),
                        parent_key: parent_key.clone(),
                        artifact_path,
                    });
                }
                Err(reason) => {
                    warn!(url = %url, reason = %reason, "Child scrape failed");
                    outcome.child_items_failed += 1;
                }
            }

            if index < last {
                pause(&self.scraper.child_delay);
            }
        }
    }

    fn scrape_child(
        &self,
        job: &JobSpecification,
        url: &str,
        start_date: NaiveDate,
    ) -> Result<PathBuf, String> {
        let command = ScrapeCommand::children(&self.scraper, url);
        let invoke = InvokeRequest::new(command, &self.scraper, job.options.auto_confirm)
            .map_err(|e| e.to_string())?;
        self.runner.run(&invoke).map_err(|e| e.to_string())?;
        self.locator
            .locate_child(url, &candidate_dates(start_date))
            .ok_or_else(|| "child artifact not found".to_string())
    }
}

/// The tool names its date directory after the local date, which may roll
/// over while a long job runs.
fn candidate_dates(start: NaiveDate) -> Vec<NaiveDate> {
    let today = Local::now().date_naive();
    if today == start {
        vec![start]
    } else {
        vec![start, today]
    }
}

/// Sleeps for a random duration inside `range`.
fn pause(range: &DelayRange) {
    let delay = jitter(range);
    if !delay.is_zero() {
        debug!(delay_ms = delay.as_millis() as u64, "Pausing before next child scrape");
        thread::sleep(delay);
    }
}

fn jitter(range: &DelayRange) -> Duration {
    if range.max_secs <= 0.0 {
        return Duration::ZERO;
    }
    let min = range.min_secs.max(0.0);
    let max = range.max_secs.max(min);
    let secs = if max > min {
        rand::rng().random_range(min..=max)
    } else {
        min
    };
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobOptions, TimeFilter};
    use crate::error::InvokeError;
    use crate::scraper::InvokeReport;
    use std::path::Path;
    use std::sync::Mutex;

    /// Writes artifacts where the real tool would and records each call.
    struct ScriptedRunner {
        scrapes_dir: PathBuf,
        items: usize,
        fail_parent: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(scrapes_dir: &Path, items: usize) -> Self {
            Self {
                scrapes_dir: scrapes_dir.to_path_buf(),
                items,
                fail_parent: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScrapeRunner for ScriptedRunner {
        fn run(&self, request: &InvokeRequest) -> Result<InvokeReport, InvokeError> {
            let args = request.command.args.clone();
            self.calls.lock().unwrap().push(args.clone());
            let date = Local::now().date_naive().format("%Y-%m-%d").to_string();

            if args[0] == "-r" {
                if self.fail_parent {
                    return Err(InvokeError::NonZeroExit {
                        code: 1,
                        stderr: "boom".to_string(),
                    });
                }
                let dir = self.scrapes_dir.join(&date).join("subreddits");
                std::fs::create_dir_all(&dir).unwrap();
                let items: Vec<_> = (0..self.items)
                    .map(|i| {
                        serde_json::json!({
                            "id": format!("p{}", i),
                            "title": format!("post {}", i),
                            "permalink": format!("/r/{}/comments/p{}/post/", args[1], i),
                        })
                    })
                    .collect();
                let name = format!("{}-top-{}-results-day.json", args[1], args[3]);
                std::fs::write(dir.join(name), serde_json::to_string(&items).unwrap()).unwrap();
            } else {
                let url = &args[1];
                let dir = self.scrapes_dir.join(&date).join("comments");
                std::fs::create_dir_all(&dir).unwrap();
                let file = format!("{}.json", crate::scraper::locator::short_hash(url));
                let body = serde_json::json!({"scrape_settings": {"url": url}, "data": {"comments": []}});
                std::fs::write(dir.join(file), body.to_string()).unwrap();
            }

            Ok(InvokeReport {
                exit_code: 0,
                prompt_answered: true,
                duration: Duration::ZERO,
                stdout_tail: String::new(),
            })
        }
    }

    fn scraper_config(scrapes_dir: &Path) -> ScraperConfig {
        let mut config = crate::config::load_config_from_str(
            r#"
version: "1.0"
scraper:
  program: urs
  working_directory: /tmp
  scrapes_directory: /tmp
switches:
  archive_enabled: false
"#,
        )
        .unwrap()
        .scraper;
        config.scrapes_directory = scrapes_dir.display().to_string();
        config.locate_attempts = 1;
        config.locate_delay_ms = 1;
        config.child_delay = DelayRange::none();
        config
    }

    fn job() -> JobSpecification {
        JobSpecification {
            id: None,
            name: "ExampleSub".to_string(),
            category: Category::Top,
            n_results: Some(3),
            keywords: None,
            time_filter: Some(TimeFilter::Day),
            enabled: true,
            schedule: None,
            options: JobOptions::default(),
        }
    }

    #[test]
    fn test_run_scrapes_parents_and_children() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(dir.path(), 3));
        let processor = JobProcessor::new(runner.clone(), scraper_config(dir.path()), true);

        let outcome = processor.run(&job());

        assert_eq!(outcome.status, ScrapeStatus::Success);
        assert_eq!(outcome.items_found, 3);
        assert_eq!(outcome.child_items_scraped, 3);
        assert_eq!(outcome.child_items_failed, 0);
        assert_eq!(outcome.children[0].parent_key, "p0");
        assert_eq!(outcome.artifact_paths().count(), 4);
        assert_eq!(runner.calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_children_skipped_when_switch_off() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(dir.path(), 3));
        let processor = JobProcessor::new(runner.clone(), scraper_config(dir.path()), false);

        let outcome = processor.run(&job());

        assert!(outcome.is_success());
        assert_eq!(outcome.child_items_scraped, 0);
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_children_skipped_by_job_option() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(dir.path(), 2));
        let processor = JobProcessor::new(runner.clone(), scraper_config(dir.path()), true);
        let mut spec = job();
        spec.options.scrape_children = false;

        let outcome = processor.run(&spec);
        assert_eq!(outcome.items_found, 2);
        assert!(outcome.children.is_empty());
    }

    #[test]
    fn test_parent_failure_is_retryable() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner = ScriptedRunner::new(dir.path(), 3);
        runner.fail_parent = true;
        let processor = JobProcessor::new(Arc::new(runner), scraper_config(dir.path()), true);

        let outcome = processor.run(&job());
        assert_eq!(outcome.status, ScrapeStatus::Failed);
        assert!(outcome.retryable);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    #[test]
    fn test_missing_artifact_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(dir.path(), 3));
        let processor = JobProcessor::new(runner, scraper_config(dir.path()), true);
        let mut spec = job();
        // The scripted tool writes "-top-"; a hot job looks for "-hot-".
        spec.category = Category::Hot;

        let outcome = processor.run(&spec);
        assert_eq!(outcome.status, ScrapeStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("artifact not found"));
        assert!(outcome.artifact_path.is_none());
    }

    #[test]
    fn test_disabled_job_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(dir.path(), 3));
        let processor = JobProcessor::new(runner.clone(), scraper_config(dir.path()), true);
        let mut spec = job();
        spec.enabled = false;

        let outcome = processor.run(&spec);
        assert_eq!(outcome.status, ScrapeStatus::Skipped);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let range = DelayRange {
            min_secs: 0.01,
            max_secs: 0.02,
        };
        for _ in 0..20 {
            let delay = jitter(&range);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(20));
        }
        assert_eq!(jitter(&DelayRange::none()), Duration::ZERO);
    }
}
