use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

pub use crate::circuit_breaker::CircuitBreakerConfig;

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 包含首次执行在内的最大尝试次数
    pub max_attempts: u32,
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 指数退避倍数
    pub multiplier: f64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.1, // 10%的随机抖动
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_attempts == 0 {
            return Err(SchedulerError::Configuration(
                "retry.max_attempts必须大于0".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(SchedulerError::Configuration(
                "retry.multiplier不能小于1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SchedulerError::Configuration(
                "retry.max_delay_ms不能小于base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SchedulerError::Configuration(
                "retry.jitter必须在0.0到1.0之间".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.jitter, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_rejects_bad_jitter() {
        let config = RetryConfig {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
