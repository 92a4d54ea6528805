pub mod database;
pub mod job_queue;
pub mod job_registry;
pub mod observability;
pub mod resource_monitor;

pub use database::{create_job_store, InMemoryJobStore, SqliteDatabase, SqliteJobStore};
pub use job_queue::{JobQueue, JobQueueConfig, QueueEntry};
pub use job_registry::{CancelRequest, Dispatch, JobRegistry, RegistryCounters};
pub use observability::{MetricsPipeline, MetricsRecorder, MetricsReport};
pub use resource_monitor::{ResourceMonitor, SysinfoSampler};
