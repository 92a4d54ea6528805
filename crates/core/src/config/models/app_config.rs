use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    observability::{MetricsConfig, ObservabilityConfig},
    persistence::PersistenceConfig,
    resilience::{CircuitBreakerConfig, RetryConfig},
    resources::{AutoscaleConfig, ResourceMonitorConfig},
    scheduler::SchedulerConfig,
};
use crate::{SchedulerError, SchedulerResult};

/// 环境变量前缀，例如 JOBFORGE__SCHEDULER__MAX_WORKERS=16
pub const ENV_PREFIX: &str = "JOBFORGE";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/jobforge.toml",
    "jobforge.toml",
    "/etc/jobforge/config.toml",
];

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub metrics: MetricsConfig,
    pub resource_monitor: ResourceMonitorConfig,
    pub autoscale: AutoscaleConfig,
    pub persistence: PersistenceConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: JOBFORGE__)
    pub fn load(config_path: Option<&str>) -> SchedulerResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(SchedulerError::Configuration(format!(
                    "配置文件不存在: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| SchedulerError::Configuration(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> SchedulerResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| SchedulerError::Configuration(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> SchedulerResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Serialization(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.metrics.validate()?;
        self.resource_monitor.validate()?;
        self.autoscale.validate()?;
        self.persistence.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpenCircuitAction, PersistenceBackend, SchedulingPolicyKind};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.policy, SchedulingPolicyKind::Priority);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            policy = "fair_share"
            max_workers = 4
            open_circuit_action = "requeue"

            [persistence]
            backend = "sqlite"
            url = "sqlite://test.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.policy, SchedulingPolicyKind::FairShare);
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.scheduler.min_workers, 1);
        assert_eq!(
            config.scheduler.open_circuit_action,
            OpenCircuitAction::Requeue
        );
        assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_worker_bounds_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [scheduler]
            min_workers = 10
            max_workers = 2
            "#,
        );
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_invalid_watermarks_rejected() {
        let mut config = AppConfig::default();
        config.autoscale.low_watermark = 90.0;
        config.autoscale.high_watermark = 50.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AppConfig::default();
        config.scheduler.max_queue_size = Some(64);
        config.scheduler.policy = SchedulingPolicyKind::Sjf;
        config.metrics.buffer_size = 128;
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.scheduler.max_queue_size, Some(64));
        assert_eq!(parsed.scheduler.policy, SchedulingPolicyKind::Sjf);
        assert_eq!(parsed.metrics.buffer_size, 128);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [scheduler]
            policy = "sjf"
            sjf_aging_factor = 0.5

            [retry]
            max_attempts = 5
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.scheduler.policy, SchedulingPolicyKind::Sjf);
        assert_eq!(config.scheduler.sjf_aging_factor, 0.5);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = AppConfig::load(Some("/nonexistent/jobforge.toml"));
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }
}
