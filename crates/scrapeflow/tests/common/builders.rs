//! Builder patterns for creating test configurations programmatically.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use scrapeflow::config::{
    ArchiveConfig, Category, Config, DelayRange, ExecutionKind, JobOptions, JobSpecification,
    JobsConfig, LoggingConfig, RetryConfig, Schedule, ScraperConfig, StorageConfig, Switches,
    TimeFilter,
};

/// Builder for `Config` instances rooted in a test's temp directories.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Everything enabled, no delays, no retry pauses.
    pub fn new(working_dir: &Path, scrapes_dir: &Path, staging_dir: &Path, storage_root: &Path) -> Self {
        Self {
            config: Config {
                version: "1.0".to_string(),
                database_path: None,
                worker_count: 2,
                logging: LoggingConfig::default(),
                switches: Switches::default(),
                scraper: ScraperConfig {
                    program: "urs".to_string(),
                    base_args: vec![],
                    working_directory: working_dir.display().to_string(),
                    scrapes_directory: scrapes_dir.display().to_string(),
                    env: BTreeMap::new(),
                    confirm_prompt: r"\[Y/N\]".to_string(),
                    confirm_response: "y".to_string(),
                    prompt_timeout_secs: 5,
                    timeout_secs: 30,
                    locate_attempts: 1,
                    locate_delay_ms: 1,
                    child_delay: DelayRange::none(),
                    child_limit: 0,
                },
                archive: ArchiveConfig {
                    staging_directory: Some(staging_dir.display().to_string()),
                    compression_level: 6,
                    synchronous: true,
                    upload_retries: 3,
                    upload_backoff_secs: 0,
                    cleanup_staging: true,
                },
                storage: StorageConfig {
                    root: Some(storage_root.display().to_string()),
                    bucket: "scrapes".to_string(),
                },
                retry: RetryConfig {
                    max_retries: 2,
                    retry_delay_secs: 0,
                    persist_retries: 2,
                    persist_retry_delay_secs: 0,
                },
                jobs: JobsConfig::default(),
            },
        }
    }

    pub fn master(mut self, enabled: bool) -> Self {
        self.config.switches.master_enabled = enabled;
        self
    }

    pub fn scheduled(mut self, enabled: bool) -> Self {
        self.config.switches.scheduled_enabled = enabled;
        self
    }

    pub fn manual(mut self, enabled: bool) -> Self {
        self.config.switches.manual_enabled = enabled;
        self
    }

    pub fn children(mut self, enabled: bool) -> Self {
        self.config.switches.child_scraping_enabled = enabled;
        self
    }

    pub fn archive(mut self, enabled: bool) -> Self {
        self.config.switches.archive_enabled = enabled;
        self
    }

    pub fn upload(mut self, enabled: bool) -> Self {
        self.config.switches.upload_enabled = enabled;
        self
    }

    pub fn asynchronous_archive(mut self) -> Self {
        self.config.archive.synchronous = false;
        self
    }

    pub fn upload_retries(mut self, retries: u32) -> Self {
        self.config.archive.upload_retries = retries;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn job(mut self, kind: ExecutionKind, job: JobBuilder) -> Self {
        let job = job.build();
        match kind {
            ExecutionKind::Scheduled => self.config.jobs.scheduled.push(job),
            ExecutionKind::Manual => self.config.jobs.manual.push(job),
        }
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Builder for `JobSpecification` instances.
pub struct JobBuilder {
    spec: JobSpecification,
}

impl JobBuilder {
    fn new(name: &str, category: Category) -> Self {
        Self {
            spec: JobSpecification {
                id: None,
                name: name.to_string(),
                category,
                n_results: None,
                keywords: None,
                time_filter: None,
                enabled: true,
                schedule: None,
                options: JobOptions::default(),
            },
        }
    }

    /// Top listing over the last day.
    pub fn top(name: &str, n: u32) -> Self {
        let mut builder = Self::new(name, Category::Top);
        builder.spec.n_results = Some(n);
        builder.spec.time_filter = Some(TimeFilter::Day);
        builder
    }

    pub fn hot(name: &str, n: u32) -> Self {
        let mut builder = Self::new(name, Category::Hot);
        builder.spec.n_results = Some(n);
        builder
    }

    pub fn search(name: &str, keywords: &str) -> Self {
        let mut builder = Self::new(name, Category::Search);
        builder.spec.keywords = Some(keywords.to_string());
        builder
    }

    pub fn id(mut self, id: &str) -> Self {
        self.spec.id = Some(id.to_string());
        self
    }

    pub fn time_filter(mut self, tf: TimeFilter) -> Self {
        self.spec.time_filter = Some(tf);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.spec.enabled = false;
        self
    }

    pub fn without_children(mut self) -> Self {
        self.spec.options.scrape_children = false;
        self
    }

    pub fn csv(mut self) -> Self {
        self.spec.options.csv = true;
        self
    }

    pub fn every(mut self, secs: u64) -> Self {
        self.spec.schedule = Some(Schedule::Interval { every_secs: secs });
        self
    }

    pub fn cron(mut self, expression: &str) -> Self {
        self.spec.schedule = Some(Schedule::Cron(expression.to_string()));
        self
    }

    pub fn build(self) -> JobSpecification {
        self.spec
    }
}
