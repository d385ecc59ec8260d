pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod scraper;
pub mod storage;
pub mod worker;

pub use config::{load_config, Config, ConfigProvider, ExecutionKind, FileConfigProvider, JobId, JobSpecification};
pub use db::Database;
pub use error::{ConfigError, Result, ScrapeflowError, StorageError, WorkerError};
pub use logging::init_logging;
pub use orchestrator::{run_with_retry, Orchestrator, OrchestratorError, RunSummary, ScheduleHost};
pub use pipeline::{ArchiveProcessor, JobProcessor, Persister, ScrapeOutcome, UploadOutcome};
pub use scraper::{ProcessInvoker, ScrapeRunner};
pub use storage::{FsObjectStore, ObjectStore};
