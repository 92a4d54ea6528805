pub mod job_execution;
pub mod requeue;

pub use job_execution::{JobRunner, RunOutcome, RunReport};
pub use requeue::Requeuer;
