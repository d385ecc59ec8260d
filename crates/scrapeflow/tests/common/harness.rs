//! Test harness for isolated orchestrator runs.
//!
//! `TestHarness` wires an [`Orchestrator`] to temp directories, an in-memory
//! database, a [`FakeRunner`] that writes artifacts the way the real tool
//! does, and a [`MemoryObjectStore`] with failure injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use serde_json::json;
use tempfile::TempDir;

use scrapeflow::config::{
    Category, Config, ConfigProvider, ExecutionKind, JobId, JobOptions, JobSpecification,
    StaticConfigProvider, TimeFilter,
};
use scrapeflow::db::query;
use scrapeflow::db::run_repo::RunRow;
use scrapeflow::error::{InvokeError, StorageError};
use scrapeflow::orchestrator::{run_with_retry, Orchestrator, RunSummary};
use scrapeflow::scraper::locator::short_hash;
use scrapeflow::scraper::{expected_filename, ArtifactRequest, InvokeReport, InvokeRequest, ScrapeRunner};
use scrapeflow::storage::{ObjectStore, StoredObject};
use scrapeflow::Database;

use super::builders::ConfigBuilder;

#[derive(Debug, Clone, Copy)]
struct Failure {
    /// `None` fails forever.
    remaining: Option<u32>,
    retryable: bool,
}

type CallHook = Box<dyn FnMut(&[String]) + Send>;

/// Stands in for the external tool: every parent call writes a listing
/// artifact, every child call writes a comments artifact.
pub struct FakeRunner {
    scrapes_dir: PathBuf,
    default_items: usize,
    children_per_item: usize,
    items: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, Failure>>,
    calls: Mutex<Vec<Vec<String>>>,
    hook: Mutex<Option<CallHook>>,
}

impl FakeRunner {
    pub fn new(scrapes_dir: &Path) -> Self {
        Self {
            scrapes_dir: scrapes_dir.to_path_buf(),
            default_items: 3,
            children_per_item: 2,
            items: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    /// Number of items the listing for `subject` contains.
    pub fn set_items(&self, subject: &str, count: usize) {
        self.items.lock().unwrap().insert(subject.to_string(), count);
    }

    /// Fails every parent scrape of `subject` with a retryable error.
    pub fn fail_subject(&self, subject: &str) {
        self.set_failure(subject, None, true);
    }

    /// Fails the next `times` parent scrapes of `subject`.
    pub fn fail_subject_times(&self, subject: &str, times: u32) {
        self.set_failure(subject, Some(times), true);
    }

    /// Fails every parent scrape of `subject` with an error not worth retrying.
    pub fn fail_subject_permanently(&self, subject: &str) {
        self.set_failure(subject, None, false);
    }

    fn set_failure(&self, subject: &str, remaining: Option<u32>, retryable: bool) {
        self.failures
            .lock()
            .unwrap()
            .insert(subject.to_string(), Failure { remaining, retryable });
    }

    /// Called with the arguments after every invocation.
    pub fn on_call(&self, hook: impl FnMut(&[String]) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn parent_calls(&self) -> usize {
        self.calls().iter().filter(|args| args[0] == "-r").count()
    }

    pub fn child_calls(&self) -> usize {
        self.calls().iter().filter(|args| args[0] == "-c").count()
    }

    fn date_dir(&self, kind: &str) -> PathBuf {
        let dir = self
            .scrapes_dir
            .join(Local::now().date_naive().format("%Y-%m-%d").to_string())
            .join(kind);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn take_failure(&self, subject: &str) -> Option<InvokeError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures.get_mut(subject)?;
        match &mut failure.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(if failure.retryable {
            InvokeError::NonZeroExit {
                code: 1,
                stderr: format!("scrape of {} failed", subject),
            }
        } else {
            InvokeError::MissingWorkingDirectory(PathBuf::from("/nonexistent"))
        })
    }

    /// Rebuilds the job from its command line to find the file name the
    /// real tool would write.
    fn parent_spec(args: &[String]) -> JobSpecification {
        let category: Category = serde_json::from_value(json!(args[2])).unwrap();
        let time_filter: Option<TimeFilter> = args
            .get(4)
            .filter(|arg| !arg.starts_with("--"))
            .map(|arg| serde_json::from_value(json!(arg)).unwrap());
        let (n_results, keywords) = match category {
            Category::Search => (None, Some(args[3].clone())),
            _ => (Some(args[3].parse().unwrap()), None),
        };
        JobSpecification {
            id: None,
            name: args[1].clone(),
            category,
            n_results,
            keywords,
            time_filter,
            enabled: true,
            schedule: None,
            options: JobOptions {
                csv: args.iter().any(|arg| arg == "--csv"),
                ..JobOptions::default()
            },
        }
    }

    fn write_parent(&self, args: &[String]) {
        let spec = Self::parent_spec(args);
        let request = ArtifactRequest::for_job(&spec).unwrap();
        let path = self.date_dir("subreddits").join(expected_filename(&request));
        let count = self
            .items
            .lock()
            .unwrap()
            .get(&spec.name)
            .copied()
            .unwrap_or(self.default_items);

        if spec.options.csv {
            let mut body = "id,title\n".to_string();
            for i in 0..count {
                body.push_str(&format!("{}_{},post {}\n", spec.name, i, i));
            }
            std::fs::write(path, body).unwrap();
            return;
        }

        let items: Vec<_> = (0..count)
            .map(|i| {
                let id = format!("{}_{}", spec.name, i);
                json!({
                    "id": id,
                    "title": format!("Post {} in {}", i, spec.name),
                    "permalink": format!("/r/{}/comments/{}/post/", spec.name, id),
                    "author": "someone",
                    "score": 10 + i,
                    "num_comments": self.children_per_item,
                    "created_utc": 1772366400,
                })
            })
            .collect();
        std::fs::write(path, serde_json::to_string(&items).unwrap()).unwrap();
    }

    fn write_children(&self, url: &str) {
        let parent = url
            .split("/comments/")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("unknown")
            .to_string();
        let comments: Vec<_> = (0..self.children_per_item)
            .map(|j| {
                json!({
                    "id": format!("{}_c{}", parent, j),
                    "body": format!("reply {}", j),
                    "parent_id": format!("t3_{}", parent),
                    "link_id": format!("t3_{}", parent),
                    "created_utc": 1772366460,
                })
            })
            .collect();
        let body = json!({"scrape_settings": {"url": url}, "data": {"comments": comments}});
        let path = self.date_dir("comments").join(format!("{}.json", short_hash(url)));
        std::fs::write(path, body.to_string()).unwrap();
    }
}

impl ScrapeRunner for FakeRunner {
    fn run(&self, request: &InvokeRequest) -> Result<InvokeReport, InvokeError> {
        let args = request.command.args.clone();
        self.calls.lock().unwrap().push(args.clone());

        let result = if args[0] == "-r" {
            match self.take_failure(&args[1]) {
                Some(e) => Err(e),
                None => {
                    self.write_parent(&args);
                    Ok(())
                }
            }
        } else {
            self.write_children(&args[1]);
            Ok(())
        };

        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(&args);
        }

        result.map(|()| InvokeReport {
            exit_code: 0,
            prompt_answered: true,
            duration: Duration::ZERO,
            stdout_tail: String::new(),
        })
    }
}

/// Object store kept in memory, with injectable upload failures.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, BTreeMap<String, String>)>>,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    puts: AtomicU32,
}

impl MemoryObjectStore {
    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn put_attempts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<(Vec<u8>, BTreeMap<String, String>)> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(
        &self,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);

        let injected = self.always_fail.load(Ordering::SeqCst)
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(StorageError::Upload {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let bytes = std::fs::read(source).map_err(|e| StorageError::WriteFile {
            path: source.to_path_buf(),
            source: e,
        })?;
        let size = bytes.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, metadata.clone()));
        Ok(StoredObject {
            key: key.to_string(),
            size,
            location: format!("memory://{}", key),
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

/// Test harness providing an isolated orchestrator per test.
pub struct TestHarness {
    temp_dir: TempDir,
    pub working_dir: PathBuf,
    pub scrapes_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub storage_root: PathBuf,
    pub db: Database,
    pub runner: Arc<FakeRunner>,
    pub store: Arc<MemoryObjectStore>,
    pub provider: Arc<StaticConfigProvider>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn new(configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let working_dir = temp_dir.path().join("tool");
        let scrapes_dir = temp_dir.path().join("scrapes");
        let staging_dir = temp_dir.path().join("staging");
        let storage_root = temp_dir.path().join("storage");
        for dir in [&working_dir, &scrapes_dir, &staging_dir] {
            std::fs::create_dir_all(dir).expect("Failed to create test directory");
        }

        let config = configure(ConfigBuilder::new(
            &working_dir,
            &scrapes_dir,
            &staging_dir,
            &storage_root,
        ))
        .build();

        let db = Database::open_in_memory().expect("Failed to open database");
        let runner = Arc::new(FakeRunner::new(&scrapes_dir));
        let store = Arc::new(MemoryObjectStore::default());
        let provider = Arc::new(StaticConfigProvider::new(config));
        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone() as Arc<dyn ConfigProvider>,
            db.clone(),
            runner.clone() as Arc<dyn ScrapeRunner>,
            Some(store.clone() as Arc<dyn ObjectStore>),
        ));

        Self {
            temp_dir,
            working_dir,
            scrapes_dir,
            staging_dir,
            storage_root,
            db,
            runner,
            store,
            provider,
            orchestrator,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> Arc<Config> {
        self.provider.current()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut Config)) {
        self.provider.update(f);
    }

    pub fn job_id(&self, kind: ExecutionKind, index: usize) -> JobId {
        self.config().jobs.for_kind(kind)[index].job_id()
    }

    /// Runs every job of `kind` and waits for the background work.
    pub fn run(&self, kind: ExecutionKind) -> RunSummary {
        let summary = self
            .orchestrator
            .run_schedule(kind, None)
            .expect("Run failed");
        self.settle();
        summary
    }

    pub fn run_job(&self, kind: ExecutionKind, job_id: &JobId) -> RunSummary {
        let summary = self
            .orchestrator
            .run_schedule(kind, Some(job_id))
            .expect("Run failed");
        self.settle();
        summary
    }

    pub fn run_with_retry(&self, kind: ExecutionKind) -> RunSummary {
        let summary = run_with_retry(&self.orchestrator, kind, None).expect("Run failed");
        self.settle();
        summary
    }

    pub fn settle(&self) {
        assert!(
            self.orchestrator.wait_idle(Duration::from_secs(30)),
            "background work did not finish"
        );
    }

    pub fn runs(&self) -> Vec<RunRow> {
        query::run_history(&self.db, None, Some(1000)).expect("Failed to list runs")
    }

    /// Files left anywhere under `dir`.
    pub fn files_under(&self, dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }
}
