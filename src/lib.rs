pub mod config;
pub mod dlq;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::{StoreConfig, WorkerConfig};
pub use dlq::DeadLetterQueue;
pub use error::{QueueError, Result};
pub use scheduler::{Job, JobQueue, JobState, RetryPolicy};
pub use store::Store;
pub use supervisor::Supervisor;
