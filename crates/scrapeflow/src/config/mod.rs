pub mod loader;
pub mod provider;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use provider::{ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use schema::{
    ArchiveConfig, Category, Config, DelayRange, ExecutionKind, JobId, JobOptions, JobSpecification,
    JobsConfig, LoggingConfig, RetryConfig, Schedule, ScrapeQuery, ScraperConfig, StorageConfig,
    Switches, TimeFilter,
};
