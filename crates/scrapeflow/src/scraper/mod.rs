pub mod artifact;
pub mod command;
pub mod invoker;
pub mod locator;

pub use artifact::{ChildArtifact, ChildItem, ParentArtifact, ParentItem};
pub use command::{ConfirmPolicy, InvokeRequest, ScrapeCommand};
pub use invoker::{InvokeReport, ProcessInvoker, ScrapeRunner};
pub use locator::{expected_filename, ArtifactLocator, ArtifactRequest};
