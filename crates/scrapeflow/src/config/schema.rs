use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub switches: Switches,
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Configured database path, or `~/.scrapeflow/data/scrapeflow.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Layered enable/disable switches. The orchestrator checks them in order:
/// master, then capability (scheduled/manual), then the per-job flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Switches {
    #[serde(default = "default_true")]
    pub master_enabled: bool,
    #[serde(default = "default_true")]
    pub scheduled_enabled: bool,
    #[serde(default = "default_true")]
    pub manual_enabled: bool,
    #[serde(default = "default_true")]
    pub child_scraping_enabled: bool,
    #[serde(default = "default_true")]
    pub archive_enabled: bool,
    #[serde(default = "default_true")]
    pub upload_enabled: bool,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            master_enabled: true,
            scheduled_enabled: true,
            manual_enabled: true,
            child_scraping_enabled: true,
            archive_enabled: true,
            upload_enabled: true,
        }
    }
}

impl Switches {
    pub fn capability_enabled(&self, kind: ExecutionKind) -> bool {
        match kind {
            ExecutionKind::Scheduled => self.scheduled_enabled,
            ExecutionKind::Manual => self.manual_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Program to execute, e.g. `poetry`.
    pub program: String,
    /// Arguments placed before the scrape arguments, e.g. `["run", "python", "Urs.py"]`.
    #[serde(default)]
    pub base_args: Vec<String>,
    /// Directory the external tool runs in. Passed to the child process only.
    pub working_directory: String,
    /// Directory the external tool writes its `{date}/…` output tree into.
    pub scrapes_directory: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Regex matched against tool output to detect the confirmation prompt.
    #[serde(default = "default_confirm_prompt")]
    pub confirm_prompt: String,
    #[serde(default = "default_confirm_response")]
    pub confirm_response: String,
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_locate_attempts")]
    pub locate_attempts: u32,
    #[serde(default = "default_locate_delay_ms")]
    pub locate_delay_ms: u64,
    #[serde(default)]
    pub child_delay: DelayRange,
    /// Children to fetch per parent item; 0 fetches all.
    #[serde(default)]
    pub child_limit: u32,
}

fn default_confirm_prompt() -> String {
    r"\[Y/N\]".to_string()
}

fn default_confirm_response() -> String {
    "y".to_string()
}

fn default_prompt_timeout() -> u64 {
    60
}

fn default_scrape_timeout() -> u64 {
    300
}

fn default_locate_attempts() -> u32 {
    5
}

fn default_locate_delay_ms() -> u64 {
    2000
}

impl ScraperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn locate_delay(&self) -> Duration {
        Duration::from_millis(self.locate_delay_ms)
    }
}

/// Randomized pause between child scrapes, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min_secs: 3.0,
            max_secs: 8.0,
        }
    }
}

impl DelayRange {
    pub fn none() -> Self {
        Self {
            min_secs: 0.0,
            max_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Where run artifacts are staged and archives are written.
    #[serde(default)]
    pub staging_directory: Option<String>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,
    /// Block the run summary until the upload finishes.
    #[serde(default)]
    pub synchronous: bool,
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,
    #[serde(default = "default_upload_backoff")]
    pub upload_backoff_secs: u64,
    #[serde(default = "default_true")]
    pub cleanup_staging: bool,
}

fn default_compression_level() -> i64 {
    6
}

fn default_upload_retries() -> u32 {
    3
}

fn default_upload_backoff() -> u64 {
    30
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            staging_directory: None,
            compression_level: default_compression_level(),
            synchronous: false,
            upload_retries: default_upload_retries(),
            upload_backoff_secs: default_upload_backoff(),
            cleanup_staging: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the object store.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

fn default_bucket() -> String {
    "scrapes".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whole-run retries performed by the schedule host.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_persist_retry_delay")]
    pub persist_retry_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    300
}

fn default_persist_retry_delay() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            persist_retries: default_max_retries(),
            persist_retry_delay_secs: default_persist_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub scheduled: Vec<JobSpecification>,
    #[serde(default)]
    pub manual: Vec<JobSpecification>,
}

impl JobsConfig {
    pub fn for_kind(&self, kind: ExecutionKind) -> &[JobSpecification] {
        match kind {
            ExecutionKind::Scheduled => &self.scheduled,
            ExecutionKind::Manual => &self.manual,
        }
    }

    pub fn find(&self, kind: ExecutionKind, id: &JobId) -> Option<&JobSpecification> {
        self.for_kind(kind).iter().find(|job| &job.job_id() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Scheduled,
    Manual,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Scheduled => "scheduled",
            ExecutionKind::Manual => "manual",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "n")]
    New,
    #[serde(alias = "h")]
    Hot,
    #[serde(alias = "t")]
    Top,
    #[serde(alias = "r")]
    Rising,
    #[serde(alias = "c")]
    Controversial,
    #[serde(alias = "s")]
    Search,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::New => "new",
            Category::Hot => "hot",
            Category::Top => "top",
            Category::Rising => "rising",
            Category::Controversial => "controversial",
            Category::Search => "search",
        }
    }

    /// One-letter code understood by the external tool.
    pub fn code(&self) -> &'static str {
        match self {
            Category::New => "n",
            Category::Hot => "h",
            Category::Top => "t",
            Category::Rising => "r",
            Category::Controversial => "c",
            Category::Search => "s",
        }
    }

    /// Only score-ranked listings take a time window.
    pub fn accepts_time_filter(&self) -> bool {
        matches!(self, Category::Top | Category::Controversial)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger for a scheduled job: a six-field cron expression (seconds first)
/// or a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schedule {
    Cron(String),
    Interval { every_secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub csv: bool,
    #[serde(default)]
    pub rules: bool,
    #[serde(default = "default_true")]
    pub auto_confirm: bool,
    #[serde(default = "default_true")]
    pub scrape_children: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            csv: false,
            rules: false,
            auto_confirm: true,
            scrape_children: true,
        }
    }
}

/// Stable identifier of a job specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either a result count or a keyword search, depending on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeQuery<'a> {
    Count(u32),
    Keywords(&'a str),
}

impl ScrapeQuery<'_> {
    /// The value passed on the tool's command line.
    pub fn argument(&self) -> String {
        match self {
            ScrapeQuery::Count(n) => n.to_string(),
            ScrapeQuery::Keywords(keywords) => keywords.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpecification {
    /// Explicit identifier; derived from the defining fields when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_results: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_filter: Option<TimeFilter>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobSpecification {
    /// Count for listing categories, keywords for search. Fails when the
    /// specification carries the wrong one (or both).
    pub fn query(&self) -> Result<ScrapeQuery<'_>, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidJob {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        match (self.category, self.n_results, self.keywords.as_deref()) {
            (Category::Search, None, Some(keywords)) if !keywords.trim().is_empty() => {
                Ok(ScrapeQuery::Keywords(keywords))
            }
            (Category::Search, _, _) => Err(invalid("search jobs need non-empty `keywords` and no `n_results`")),
            (_, Some(n), None) if n > 0 => Ok(ScrapeQuery::Count(n)),
            (_, _, Some(_)) => Err(invalid("`keywords` is only valid for the search category")),
            _ => Err(invalid("`n_results` must be a positive number")),
        }
    }

    /// Time filter, dropped for categories where the tool ignores it.
    pub fn effective_time_filter(&self) -> Option<TimeFilter> {
        self.time_filter
            .filter(|_| self.category.accepts_time_filter())
    }

    pub fn job_id(&self) -> JobId {
        if let Some(id) = &self.id {
            return JobId::new(id.clone());
        }

        let digest = hex::encode(Sha256::digest(self.fingerprint().as_bytes()));
        JobId::new(&digest[..12])
    }

    /// `name|category|count-or-keywords|time_filter`: the fields that make
    /// two specifications the same job.
    pub fn fingerprint(&self) -> String {
        let query = match (self.n_results, self.keywords.as_deref()) {
            (_, Some(keywords)) => keywords.trim().to_string(),
            (Some(n), None) => n.to_string(),
            (None, None) => String::new(),
        };
        let time_filter = self
            .effective_time_filter()
            .map(|tf| tf.as_str())
            .unwrap_or("");

        format!(
            "{}|{}|{}|{}",
            self.name,
            self.category.as_str(),
            query,
            time_filter
        )
    }

    /// Short human-readable label for logs.
    pub fn label(&self) -> String {
        let query = self
            .query()
            .map(|q| q.argument())
            .unwrap_or_else(|_| "?".to_string());
        match self.effective_time_filter() {
            Some(tf) => format!("{} ({}, {}, {})", self.name, self.category, query, tf),
            None => format!("{} ({}, {})", self.name, self.category, query),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_job() -> JobSpecification {
        JobSpecification {
            id: None,
            name: "ExampleSub".to_string(),
            category: Category::Top,
            n_results: Some(25),
            keywords: None,
            time_filter: Some(TimeFilter::Day),
            enabled: true,
            schedule: None,
            options: JobOptions::default(),
        }
    }

    #[test]
    fn test_job_id_is_stable() {
        let a = top_job();
        let b = top_job();
        assert_eq!(a.job_id(), b.job_id());
        assert_eq!(a.job_id().as_str().len(), 12);
    }

    #[test]
    fn test_job_id_ignores_non_defining_fields() {
        let a = top_job();
        let mut b = top_job();
        b.enabled = false;
        b.options.csv = true;
        b.schedule = Some(Schedule::Interval { every_secs: 60 });
        assert_eq!(a.job_id(), b.job_id());
    }

    #[test]
    fn test_job_id_changes_with_defining_fields() {
        let a = top_job();
        let mut b = top_job();
        b.n_results = Some(26);
        assert_ne!(a.job_id(), b.job_id());
    }

    #[test]
    fn test_explicit_id_wins() {
        let mut job = top_job();
        job.id = Some("daily-top".to_string());
        assert_eq!(job.job_id().as_str(), "daily-top");
    }

    #[test]
    fn test_query_shapes() {
        let job = top_job();
        assert_eq!(job.query().unwrap(), ScrapeQuery::Count(25));

        let mut search = top_job();
        search.category = Category::Search;
        search.n_results = None;
        search.keywords = Some("cashback rewards".to_string());
        assert_eq!(
            search.query().unwrap(),
            ScrapeQuery::Keywords("cashback rewards")
        );

        let mut both = top_job();
        both.keywords = Some("x".to_string());
        assert!(both.query().is_err());

        let mut zero = top_job();
        zero.n_results = Some(0);
        assert!(zero.query().is_err());
    }

    #[test]
    fn test_time_filter_dropped_for_listing_categories() {
        let mut job = top_job();
        job.category = Category::Hot;
        assert_eq!(job.effective_time_filter(), None);

        let mut job = top_job();
        job.category = Category::Search;
        job.n_results = None;
        job.keywords = Some("rust".to_string());
        assert_eq!(job.effective_time_filter(), None);

        let mut job = top_job();
        job.category = Category::Controversial;
        assert_eq!(job.effective_time_filter(), Some(TimeFilter::Day));
    }

    #[test]
    fn test_ignored_time_filter_does_not_change_job_id() {
        let mut with_filter = top_job();
        with_filter.category = Category::Search;
        with_filter.n_results = None;
        with_filter.keywords = Some("rust".to_string());
        let mut without_filter = with_filter.clone();
        without_filter.time_filter = None;

        assert_eq!(with_filter.job_id(), without_filter.job_id());
    }

    #[test]
    fn test_category_accepts_codes() {
        let category: Category = serde_json::from_str("\"t\"").unwrap();
        assert_eq!(category, Category::Top);
        let category: Category = serde_json::from_str("\"controversial\"").unwrap();
        assert_eq!(category, Category::Controversial);
        assert_eq!(Category::Search.code(), "s");
    }

    #[test]
    fn test_schedule_untagged() {
        let cron: Schedule = serde_json::from_str("\"0 30 23 * * *\"").unwrap();
        assert_eq!(cron, Schedule::Cron("0 30 23 * * *".to_string()));
        let every: Schedule = serde_json::from_str("{\"every_secs\": 3600}").unwrap();
        assert_eq!(every, Schedule::Interval { every_secs: 3600 });
    }

    #[test]
    fn test_label() {
        assert_eq!(top_job().label(), "ExampleSub (top, 25, day)");
    }
}
