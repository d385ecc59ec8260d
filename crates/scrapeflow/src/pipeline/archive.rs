//! Packages a batch's artifacts into one zip and ships it to object storage.
//!
//! Packaging and upload form a single retry unit. The local zip is only
//! deleted after the object store confirmed the upload and the archive
//! row was written; a failed upload leaves it in place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{Config, ExecutionKind, JobSpecification, ScrapeQuery};
use crate::db::archive_repo::{self, NewArchive};
use crate::db::{format_timestamp, Database};
use crate::scraper::locator::short_hash;
use crate::storage::ObjectStore;

use super::error::ArchiveError;

/// Entry appended to every archive describing its contents.
pub const ARCHIVE_METADATA_ENTRY: &str = "archive_metadata.json";

/// Suffixes tried before a batch gives up on finding a free name.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Subject lists longer than this are replaced by a hash in archive names.
pub const SUBJECT_LIST_MAX: usize = 60;

/// Name shared by the local zip and the object key, without extension.
///
/// One job: `{subject}_{category}[_{time filter}]_{count | kw<hash>}_{YYYYmmdd_HHMM}`.
/// Several jobs: `{subjects joined by + | multi<hash>}_{hash of job fingerprints}_{YYYYmmdd_HHMM}`.
pub fn archive_name(jobs: &[JobSpecification], at: DateTime<Local>) -> String {
    let timestamp = at.format("%Y%m%d_%H%M");

    if let [job] = jobs {
        let query = match job.query() {
            Ok(ScrapeQuery::Count(n)) => n.to_string(),
            Ok(ScrapeQuery::Keywords(keywords)) => format!("kw{}", short_hash(keywords.trim())),
            Err(_) => format!("job{}", job.job_id()),
        };
        let mut name = format!("{}_{}", job.name, job.category.as_str());
        if let Some(tf) = job.effective_time_filter() {
            name.push('_');
            name.push_str(tf.as_str());
        }
        return format!("{}_{}_{}", name, query, timestamp);
    }

    let joined = subjects(jobs).join("+");
    let subject_part = if joined.chars().count() > SUBJECT_LIST_MAX {
        format!("multi{}", short_hash(&joined))
    } else {
        joined
    };

    let mut fingerprints: Vec<String> = jobs.iter().map(JobSpecification::fingerprint).collect();
    fingerprints.sort();
    format!(
        "{}_{}_{}",
        subject_part,
        short_hash(&fingerprints.join(";")),
        timestamp
    )
}

/// `{kind}_scrapes/{subject | multi}/{category | mixed}/{YYYY-MM-DD}/{name}.zip`
pub fn object_key(kind: ExecutionKind, jobs: &[JobSpecification], at: DateTime<Local>, name: &str) -> String {
    let subjects = subjects(jobs);
    let subject = match subjects.as_slice() {
        [one] => one.clone(),
        _ => "multi".to_string(),
    };
    let categories: BTreeSet<&str> = jobs.iter().map(|job| job.category.as_str()).collect();
    let category = match categories.len() {
        1 => categories.into_iter().next().unwrap_or("mixed"),
        _ => "mixed",
    };
    format!(
        "{}_scrapes/{}/{}/{}/{}.zip",
        kind.as_str(),
        subject,
        category,
        at.format("%Y-%m-%d"),
        name
    )
}

fn subjects(jobs: &[JobSpecification]) -> Vec<String> {
    jobs.iter()
        .map(|job| job.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub archive_name: String,
    pub created_at: String,
    pub kind: String,
    pub file_count: u64,
    pub total_size: u64,
    pub compressed_size: u64,
    pub subjects: Vec<String>,
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub file_count: u64,
    pub total_size: u64,
    /// Size of the compressed artifacts, before the metadata entry is added.
    pub compressed_size: u64,
}

/// Zips every regular file under `source` into `destination`, then appends
/// [`ARCHIVE_METADATA_ENTRY`].
pub fn package(
    source: &Path,
    destination: &Path,
    compression_level: i64,
    mut metadata: ArchiveMetadata,
) -> Result<PackagedArchive, ArchiveError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArchiveError::Io { path, source }
    };

    let mut files = Vec::new();
    if source.is_dir() {
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Io {
                path: source.to_path_buf(),
                source: e.into(),
            })?;
            if entry.file_type().is_file() && entry.path() != destination {
                files.push(entry.into_path());
            }
        }
    }
    if files.is_empty() {
        return Err(ArchiveError::EmptySource(source.to_path_buf()));
    }

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let options = if compression_level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compression_level))
    };

    let file = File::create(destination).map_err(io_error(destination))?;
    let mut zip = ZipWriter::new(file);
    let mut total_size = 0u64;
    for path in &files {
        let name = entry_name(source, path);
        zip.start_file(name, options)?;
        let mut input = File::open(path).map_err(io_error(path))?;
        total_size += std::io::copy(&mut input, &mut zip).map_err(io_error(path))?;
    }
    let file = zip.finish()?;
    let compressed_size = file.metadata().map_err(io_error(destination))?.len();
    drop(file);

    metadata.file_count = files.len() as u64;
    metadata.total_size = total_size;
    metadata.compressed_size = compressed_size;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(destination)
        .map_err(io_error(destination))?;
    let mut zip = ZipWriter::new_append(file)?;
    zip.start_file(ARCHIVE_METADATA_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec_pretty(&metadata)?)
        .map_err(io_error(destination))?;
    zip.finish()?;

    Ok(PackagedArchive {
        path: destination.to_path_buf(),
        file_count: files.len() as u64,
        total_size,
        compressed_size,
    })
}

/// Zip entry names always use `/`.
fn entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// One batch to archive.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub kind: ExecutionKind,
    pub source_directory: PathBuf,
    pub jobs: Vec<JobSpecification>,
    /// Items found per subject in this batch.
    pub item_counts: BTreeMap<String, u64>,
    /// Extra metadata attached to the uploaded object.
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub archive_name: String,
    pub archive_path: PathBuf,
    pub object_key: String,
    pub uploaded: bool,
    /// Whether the local zip is still on disk.
    pub local_retained: bool,
    pub attempts: u32,
    pub file_count: u64,
    pub original_size: u64,
    pub compressed_size: u64,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Where finished zips are written before upload.
    pub output_directory: PathBuf,
    pub compression_level: i64,
    pub upload_enabled: bool,
    pub upload_retries: u32,
    pub upload_backoff: Duration,
    pub cleanup_staging: bool,
}

impl ArchiveSettings {
    /// `None` when no staging directory is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let staging = config.archive.staging_directory.as_ref()?;
        Some(Self {
            output_directory: PathBuf::from(staging).join("archives"),
            compression_level: config.archive.compression_level,
            upload_enabled: config.switches.upload_enabled,
            upload_retries: config.archive.upload_retries.max(1),
            upload_backoff: Duration::from_secs(config.archive.upload_backoff_secs),
            cleanup_staging: config.archive.cleanup_staging,
        })
    }
}

pub struct ArchiveProcessor {
    db: Database,
    store: Option<Arc<dyn ObjectStore>>,
    settings: ArchiveSettings,
}

impl ArchiveProcessor {
    pub fn new(db: Database, store: Option<Arc<dyn ObjectStore>>, settings: ArchiveSettings) -> Self {
        Self { db, store, settings }
    }

    fn upload_store(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.store.as_ref().filter(|_| self.settings.upload_enabled)
    }

    pub fn archive_and_upload(&self, request: &ArchiveRequest) -> UploadOutcome {
        let _span = info_span!("archive", kind = %request.kind, jobs = request.jobs.len()).entered();

        let archive_name = archive_name(&request.jobs, request.created_at);
        let mut outcome = UploadOutcome {
            archive_path: self.settings.output_directory.join(format!("{}.zip", archive_name)),
            object_key: object_key(request.kind, &request.jobs, request.created_at, &archive_name),
            archive_name,
            uploaded: false,
            local_retained: false,
            attempts: 0,
            file_count: 0,
            original_size: 0,
            compressed_size: 0,
            error: None,
        };

        match self.claim_name(request) {
            Ok((name, key, path)) => {
                outcome.archive_name = name;
                outcome.object_key = key;
                outcome.archive_path = path;
            }
            Err(e) => {
                warn!(error = %e, "Could not claim an archive name");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        let attempts = if self.upload_store().is_some() {
            self.settings.upload_retries.max(1)
        } else {
            1
        };

        for attempt in 1..=attempts {
            outcome.attempts = attempt;
            match self.attempt(request, &mut outcome) {
                Ok(()) => {
                    outcome.error = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Archive attempt failed");
                    outcome.error = Some(e.to_string());
                    if !e.is_retryable() || attempt == attempts {
                        break;
                    }
                    thread::sleep(self.settings.upload_backoff);
                }
            }
        }

        if outcome.file_count == 0 {
            // Packaging never completed; drop the claimed placeholder.
            if let Err(e) = std::fs::remove_file(&outcome.archive_path) {
                debug!(error = %e, "Could not release archive name");
            }
        }

        outcome.local_retained = outcome.archive_path.exists();
        if outcome.is_success() {
            self.cleanup(request, &mut outcome);
        }

        info!(
            key = %outcome.object_key,
            uploaded = outcome.uploaded,
            files = outcome.file_count,
            attempts = outcome.attempts,
            "Archive finished"
        );
        outcome
    }

    fn attempt(&self, request: &ArchiveRequest, outcome: &mut UploadOutcome) -> Result<(), ArchiveError> {
        let metadata = ArchiveMetadata {
            archive_name: outcome.archive_name.clone(),
            created_at: format_timestamp(request.created_at.with_timezone(&Utc)),
            kind: request.kind.as_str().to_string(),
            file_count: 0,
            total_size: 0,
            compressed_size: 0,
            subjects: subjects(&request.jobs),
            jobs: request.jobs.iter().map(JobSpecification::label).collect(),
        };
        let packaged = package(
            &request.source_directory,
            &outcome.archive_path,
            self.settings.compression_level,
            metadata,
        )?;
        outcome.file_count = packaged.file_count;
        outcome.original_size = packaged.total_size;
        outcome.compressed_size = packaged.compressed_size;

        let Some(store) = self.upload_store() else {
            debug!("Uploads disabled; keeping local archive");
            return Ok(());
        };

        let object_metadata = self.object_metadata(request, outcome);
        store.put(&outcome.object_key, &packaged.path, &object_metadata)?;
        outcome.uploaded = true;

        let row = NewArchive {
            filename: format!("{}.zip", outcome.archive_name),
            archive_category: request.kind.as_str().to_string(),
            local_path: Some(packaged.path.display().to_string()),
            object_key: outcome.object_key.clone(),
            original_size: packaged.total_size,
            compressed_size: packaged.compressed_size,
            file_count: packaged.file_count,
            subjects: subjects(&request.jobs),
            item_counts: request.item_counts.clone(),
            uploaded_at: format_timestamp(Utc::now()),
        };
        if archive_repo::record(&self.db, &row)?.is_none() {
            warn!(key = %outcome.object_key, "Archive row already recorded");
        }
        Ok(())
    }

    fn object_metadata(&self, request: &ArchiveRequest, outcome: &UploadOutcome) -> BTreeMap<String, String> {
        let mut metadata = request.metadata.clone();
        let total_items: u64 = request.item_counts.values().sum();
        metadata.extend([
            ("archive_name".to_string(), outcome.archive_name.clone()),
            ("kind".to_string(), request.kind.as_str().to_string()),
            ("subjects".to_string(), subjects(&request.jobs).join(",")),
            ("job_count".to_string(), request.jobs.len().to_string()),
            ("file_count".to_string(), outcome.file_count.to_string()),
            ("original_size".to_string(), outcome.original_size.to_string()),
            ("compressed_size".to_string(), outcome.compressed_size.to_string()),
            ("total_items".to_string(), total_items.to_string()),
            ("created_at".to_string(), format_timestamp(request.created_at.with_timezone(&Utc))),
        ]);
        metadata
    }

    /// The deterministic name, with a numeric suffix when an earlier batch
    /// in the same minute already holds it.
    ///
    /// The local zip is created with `create_new`, so two workers racing for
    /// the same name never share a file: the loser moves on to the next suffix.
    fn claim_name(&self, request: &ArchiveRequest) -> Result<(String, String, PathBuf), ArchiveError> {
        let directory = &self.settings.output_directory;
        std::fs::create_dir_all(directory).map_err(|source| ArchiveError::Io {
            path: directory.clone(),
            source,
        })?;

        let base = archive_name(&request.jobs, request.created_at);
        for counter in 1..=MAX_NAME_SUFFIX {
            let name = if counter == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, counter)
            };
            let key = object_key(request.kind, &request.jobs, request.created_at, &name);
            if self.key_taken(&key) {
                continue;
            }

            let path = directory.join(format!("{}.zip", name));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok((name, key, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(ArchiveError::Io { path, source }),
            }
        }
        Err(ArchiveError::NameExhausted(base))
    }

    fn key_taken(&self, key: &str) -> bool {
        if matches!(archive_repo::find_by_key(&self.db, key), Ok(Some(_))) {
            return true;
        }
        self.upload_store()
            .is_some_and(|store| store.exists(key).unwrap_or(false))
    }

    fn cleanup(&self, request: &ArchiveRequest, outcome: &mut UploadOutcome) {
        if outcome.uploaded {
            match std::fs::remove_file(&outcome.archive_path) {
                Ok(()) => {
                    outcome.local_retained = false;
                    if let Err(e) = archive_repo::mark_deleted_locally(&self.db, &outcome.object_key) {
                        warn!(error = %e, "Could not record local deletion");
                    }
                }
                Err(e) => warn!(
                    path = %outcome.archive_path.display(),
                    error = %e,
                    "Could not delete uploaded archive"
                ),
            }
        }

        if self.settings.cleanup_staging {
            if let Err(e) = std::fs::remove_dir_all(&request.source_directory) {
                warn!(
                    path = %request.source_directory.display(),
                    error = %e,
                    "Could not remove staging directory"
                );
            }
        }
    }
}
