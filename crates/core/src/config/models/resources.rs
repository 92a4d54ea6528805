use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 资源监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMonitorConfig {
    /// 是否启用监控
    pub enabled: bool,
    /// 采样间隔（毫秒）
    pub sample_interval_ms: u64,
    /// 历史数据保留数量
    pub history_size: usize,
    /// CPU使用警告阈值（百分比）
    pub cpu_warning_percent: f64,
    /// 内存使用警告阈值（百分比）
    pub memory_warning_percent: f64,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 5_000,
            history_size: 60, // 保留60个数据点
            cpu_warning_percent: 90.0,
            memory_warning_percent: 90.0,
        }
    }
}

impl ResourceMonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.sample_interval_ms == 0 {
            return Err(SchedulerError::Configuration(
                "resource_monitor.sample_interval_ms必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 自动扩缩容配置，上下水位分离以避免抖动
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// 利用率低于此值且有积压时扩容
    pub high_watermark: f64,
    /// 利用率低于此值且持续空闲时缩容
    pub low_watermark: f64,
    /// 持续空闲多久才缩容（毫秒）
    pub scale_down_window_ms: u64,
    /// 每次调整的Worker数
    pub step: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2_000,
            high_watermark: 80.0,
            low_watermark: 30.0,
            scale_down_window_ms: 30_000,
            step: 1,
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn scale_down_window(&self) -> Duration {
        Duration::from_millis(self.scale_down_window_ms)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.interval_ms == 0 {
            return Err(SchedulerError::Configuration(
                "autoscale.interval_ms必须大于0".to_string(),
            ));
        }
        if self.step == 0 {
            return Err(SchedulerError::Configuration(
                "autoscale.step必须大于0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.high_watermark)
            || !(0.0..=100.0).contains(&self.low_watermark)
        {
            return Err(SchedulerError::Configuration(
                "autoscale水位必须在0到100之间".to_string(),
            ));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(SchedulerError::Configuration(format!(
                "autoscale.low_watermark ({}) 必须小于 high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}
