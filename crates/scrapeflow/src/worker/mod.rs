pub mod pool;
pub mod task;

pub use pool::{WorkerContext, WorkerPool};
pub use task::{ArchiveTask, PersistRetry, PersistTask, Task, TaskResult};

pub use crossbeam_channel;
