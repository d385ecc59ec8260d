//! Finds the files the external tool writes.
//!
//! The tool does not report its output path, so the name is recomputed
//! here from the same inputs. [`expected_filename`] is the single place
//! that encodes the tool's naming scheme.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::{Category, JobSpecification, ScrapeQuery, ScraperConfig, TimeFilter};
use crate::error::ConfigError;
use crate::scraper::artifact::child_artifact_url;

/// Keywords longer than this are replaced by a truncated prefix plus hash.
pub const KEYWORD_HASH_THRESHOLD: usize = 50;
const KEYWORD_PREFIX_LEN: usize = 20;

/// Inputs that determine a parent artifact's file name.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactRequest<'a> {
    pub subject: &'a str,
    pub category: Category,
    pub query: ScrapeQuery<'a>,
    pub time_filter: Option<TimeFilter>,
    pub csv: bool,
}

impl<'a> ArtifactRequest<'a> {
    pub fn for_job(job: &'a JobSpecification) -> Result<Self, ConfigError> {
        Ok(Self {
            subject: &job.name,
            category: job.category,
            query: job.query()?,
            time_filter: job.effective_time_filter(),
            csv: job.options.csv,
        })
    }
}

/// File name the tool writes for `request`, e.g. `rust-top-25-results-day.json`.
pub fn expected_filename(request: &ArtifactRequest<'_>) -> String {
    let mut name = match request.query {
        ScrapeQuery::Count(n) => format!(
            "{}-{}-{}-results",
            request.subject,
            request.category.as_str(),
            n
        ),
        ScrapeQuery::Keywords(keywords) => format!(
            "{}-search-'{}'",
            request.subject,
            keyword_token(keywords)
        ),
    };

    if let Some(tf) = request.time_filter {
        name.push('-');
        name.push_str(tf.as_str());
    }

    name.push_str(if request.csv { ".csv" } else { ".json" });
    name
}

/// Filesystem-safe form of a keyword string. Deterministic: equal
/// keywords always give equal tokens.
pub fn keyword_token(keywords: &str) -> String {
    let keywords = keywords.trim();
    let sanitized: String = keywords
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();

    if keywords.chars().count() <= KEYWORD_HASH_THRESHOLD {
        return sanitized;
    }

    let prefix: String = sanitized.chars().take(KEYWORD_PREFIX_LEN).collect();
    format!("{}-{}", prefix, short_hash(keywords))
}

/// First 8 hex chars of the SHA-256 of `value`.
pub fn short_hash(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    digest[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    scrapes_dir: PathBuf,
    attempts: u32,
    delay: Duration,
}

impl ArtifactLocator {
    pub fn new(scrapes_dir: impl Into<PathBuf>, attempts: u32, delay: Duration) -> Self {
        Self {
            scrapes_dir: scrapes_dir.into(),
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(
            &config.scrapes_directory,
            config.locate_attempts,
            config.locate_delay(),
        )
    }

    pub fn scrapes_dir(&self) -> &Path {
        &self.scrapes_dir
    }

    pub fn expected_path(&self, date: NaiveDate, request: &ArtifactRequest<'_>) -> PathBuf {
        self.scrapes_dir
            .join(date.format("%Y-%m-%d").to_string())
            .join("subreddits")
            .join(expected_filename(request))
    }

    /// Polls for the parent artifact under each candidate date directory.
    /// `None` means the scrape produced nothing usable.
    pub fn locate(&self, request: &ArtifactRequest<'_>, dates: &[NaiveDate]) -> Option<PathBuf> {
        let candidates: Vec<PathBuf> = dedup_dates(dates)
            .into_iter()
            .map(|date| self.expected_path(date, request))
            .collect();

        self.poll(|| candidates.iter().find(|path| path.is_file()).cloned())
            .inspect(|path| tracing::debug!(path = %path.display(), "Located artifact"))
            .or_else(|| {
                tracing::warn!(
                    expected = ?candidates,
                    attempts = self.attempts,
                    "Artifact not found"
                );
                None
            })
    }

    /// Polls for the child artifact whose `scrape_settings.url` equals `url`.
    /// The newest match wins when the same URL was scraped more than once.
    pub fn locate_child(&self, url: &str, dates: &[NaiveDate]) -> Option<PathBuf> {
        let dirs: Vec<PathBuf> = dedup_dates(dates)
            .into_iter()
            .map(|date| {
                self.scrapes_dir
                    .join(date.format("%Y-%m-%d").to_string())
                    .join("comments")
            })
            .collect();

        self.poll(|| {
            dirs.iter()
                .filter(|dir| dir.is_dir())
                .flat_map(|dir| {
                    WalkDir::new(dir)
                        .min_depth(1)
                        .max_depth(1)
                        .into_iter()
                        .filter_map(|entry| entry.ok())
                })
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
                })
                .filter(|entry| child_artifact_url(entry.path()).as_deref() == Some(url))
                .max_by_key(|entry| entry.metadata().ok().and_then(|m| m.modified().ok()))
                .map(|entry| entry.into_path())
        })
    }

    fn poll<T>(&self, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        for attempt in 1..=self.attempts {
            if let Some(found) = probe() {
                return Some(found);
            }
            if attempt < self.attempts {
                thread::sleep(self.delay);
            }
        }
        None
    }
}

fn dedup_dates(dates: &[NaiveDate]) -> Vec<NaiveDate> {
    let mut unique = Vec::with_capacity(dates.len());
    for date in dates {
        if !unique.contains(date) {
            unique.push(*date);
        }
    }
    unique
}
