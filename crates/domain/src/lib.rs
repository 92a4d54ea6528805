pub mod entities;
pub mod events;
pub mod ports;
pub mod repositories;
pub mod retry_policy;
pub mod state_machine;
pub mod value_objects;

pub use entities::*;
pub use events::*;
pub use ports::{ExecutionContext, JobExecutor, UsageSample, UsageSampler, WorkloadProbe};
pub use repositories::*;
pub use retry_policy::RetryPolicy;
pub use value_objects::*;
pub use jobforge_core::{SchedulerError, SchedulerResult};
