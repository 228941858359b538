pub mod backoff;
pub mod job;
pub mod lease;
pub mod queue;

pub use backoff::{FailureOutcome, RetryPolicy};
pub use job::{Job, JobState};
pub use lease::{Reclaimed, WorkerRecord, WorkerRegistry};
pub use queue::{JobQueue, StateCounts};
