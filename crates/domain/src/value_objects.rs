use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 优先级档位，声明顺序即出队顺序（Urgent最先）
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 5] = [
        PriorityTier::Urgent,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
        PriorityTier::Background,
    ];

    /// 数值越小越先出队
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Urgent => "urgent",
            PriorityTier::High => "high",
            PriorityTier::Normal => "normal",
            PriorityTier::Low => "low",
            PriorityTier::Background => "background",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 某一时刻的资源快照，只保留最新值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: Option<f64>,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn empty() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            gpu_percent: None,
            queue_depth: 0,
            active_workers: 0,
            timestamp: Utc::now(),
        }
    }

    /// 取CPU、内存、GPU中最紧张的一项
    pub fn utilization(&self) -> f64 {
        let base = self.cpu_percent.max(self.memory_percent);
        match self.gpu_percent {
            Some(gpu) => base.max(gpu),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        let mut tiers = vec![
            PriorityTier::Low,
            PriorityTier::Urgent,
            PriorityTier::Background,
            PriorityTier::Normal,
            PriorityTier::High,
        ];
        tiers.sort();
        assert_eq!(tiers, PriorityTier::ALL.to_vec());
        assert_eq!(PriorityTier::Urgent.rank(), 0);
        assert_eq!(PriorityTier::default(), PriorityTier::Normal);
    }

    #[test]
    fn test_utilization_takes_max() {
        let mut snapshot = ResourceSnapshot::empty();
        snapshot.cpu_percent = 40.0;
        snapshot.memory_percent = 65.0;
        assert_eq!(snapshot.utilization(), 65.0);
        snapshot.gpu_percent = Some(90.0);
        assert_eq!(snapshot.utilization(), 90.0);
    }
}
