use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 指标管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 事件缓冲区容量，满时丢弃新事件
    pub buffer_size: usize,
    /// 单批最多消费的事件数
    pub batch_size: usize,
    /// 凑批的最长等待（毫秒）
    pub batch_timeout_ms: u64,
    /// 延迟目标，超过即诊断为慢路径
    pub latency_target_ms: u64,
    /// 移动平均的平滑系数
    pub ema_alpha: f64,
    /// 类别错误率诊断所需的最少样本
    pub min_class_samples: u64,
    pub report_interval_ms: u64,
    /// 关闭时等待消费者退出的上限
    pub join_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            batch_size: 256,
            batch_timeout_ms: 200,
            latency_target_ms: 60_000,
            ema_alpha: 0.2,
            min_class_samples: 10,
            report_interval_ms: 30_000,
            join_timeout_ms: 2_000,
        }
    }
}

impl MetricsConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.buffer_size == 0 {
            return Err(SchedulerError::Configuration(
                "metrics.buffer_size必须大于0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::Configuration(
                "metrics.batch_size必须大于0".to_string(),
            ));
        }
        if self.batch_timeout_ms == 0 {
            return Err(SchedulerError::Configuration(
                "metrics.batch_timeout_ms必须大于0".to_string(),
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(SchedulerError::Configuration(
                "metrics.ema_alpha必须在(0, 1]之间".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub prometheus_enabled: bool,
    pub prometheus_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            prometheus_enabled: false,
            prometheus_bind_address: "127.0.0.1:9100".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        crate::logging::LogLevel::parse(&self.log_level)?;
        if self.prometheus_enabled
            && self
                .prometheus_bind_address
                .parse::<std::net::SocketAddr>()
                .is_err()
        {
            return Err(SchedulerError::Configuration(format!(
                "无效的Prometheus监听地址: {}",
                self.prometheus_bind_address
            )));
        }
        Ok(())
    }
}
