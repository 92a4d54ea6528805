pub mod executor;
pub mod workload;

pub use executor::{ExecutionContext, JobExecutor};
pub use workload::{UsageSample, UsageSampler, WorkloadProbe};
