pub mod executor;
pub mod job;
pub mod queue;
pub mod store;
pub mod vetter;
pub mod worker;

pub use executor::RemoteExecutor;
pub use job::{Job, JobStatus};
pub use queue::{NodeStats, QueueManager};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobUpdate, PostgresJobStore};
pub use vetter::{CodeVetter, VetterVerdict};
pub use worker::{Worker, WorkerPool};
