pub mod archive;
pub mod error;
pub mod job_processor;
pub mod persist;
pub mod staging;

pub use archive::{
    archive_name, object_key, ArchiveMetadata, ArchiveProcessor, ArchiveRequest, ArchiveSettings,
    UploadOutcome,
};
pub use error::{ArchiveError, PersistError, PipelineWarning};
pub use job_processor::{ChildArtifactRef, JobProcessor, ScrapeOutcome, ScrapeStatus};
pub use persist::{PersistOutcome, Persister};
pub use staging::{batch_directory, stage_artifacts};
