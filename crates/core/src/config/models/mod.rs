pub mod app_config;
pub mod observability;
pub mod persistence;
pub mod resilience;
pub mod resources;
pub mod scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use observability::{LogFormat, MetricsConfig, ObservabilityConfig};
pub use persistence::{PersistenceBackend, PersistenceConfig};
pub use resilience::RetryConfig;
pub use resources::{AutoscaleConfig, ResourceMonitorConfig};
pub use scheduler::{OpenCircuitAction, SchedulerConfig, SchedulingPolicyKind};
