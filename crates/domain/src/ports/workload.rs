/// 资源监控读取的调度负载视图
pub trait WorkloadProbe: Send + Sync {
    fn queue_depth(&self) -> usize;

    /// 无界队列返回None
    fn queue_capacity(&self) -> Option<usize>;

    fn active_workers(&self) -> usize;
}

/// 一次主机资源读数，百分比范围0-100
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// 没有可用的GPU读数时为None
    pub gpu_percent: Option<f64>,
}

/// 主机资源采样器
pub trait UsageSampler: Send + Sync {
    fn sample(&self) -> UsageSample;
}
