use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScrapeflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scraper invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Orchestration error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid job '{name}': {reason}")]
    InvalidJob { name: String, reason: String },

    #[error("Invalid prompt pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Missing required setting: {0}")]
    Missing(String),
}

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Working directory '{0}' does not exist")]
    MissingWorkingDirectory(PathBuf),

    #[error("Scraper timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Timed out after {secs}s waiting for confirmation prompt")]
    PromptTimeout { secs: u64 },

    #[error("Scraper exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Scraper I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read artifact '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact '{path}' is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact '{path}' has unexpected shape: {reason}")]
    Shape { path: PathBuf, reason: String },

    #[error("Unsupported artifact format for '{0}' (only JSON artifacts can be parsed)")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid item: {0}")]
    Item(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy '{from}' to '{to}': {source}")]
    CopyFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Upload of '{key}' failed: {reason}")]
    Upload { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl InvokeError {
    /// Every invocation failure is an upstream problem; the orchestrator may retry it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InvokeError::MissingWorkingDirectory(_))
    }
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Upload { .. } | StorageError::WriteFile { .. } | StorageError::CopyFile { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScrapeflowError>;
