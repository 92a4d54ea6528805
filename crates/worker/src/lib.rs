pub mod components;
pub mod executor_registry;
pub mod executors;
pub mod pool;

pub use components::{JobRunner, Requeuer, RunOutcome, RunReport};
pub use executor_registry::ExecutorRegistry;
pub use executors::{EchoExecutor, ShellExecutor, ShellJobParams};
pub use pool::{PoolConfig, ShutdownReport, WorkerPool};
