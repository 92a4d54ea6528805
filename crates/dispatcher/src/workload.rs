use std::sync::Arc;

use jobforge_domain::WorkloadProbe;
use jobforge_infrastructure::job_queue::JobQueue;
use jobforge_worker::WorkerPool;

/// 队列与Worker池的实时负载，供资源监控和扩缩容读取
pub struct SchedulerWorkload {
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
}

impl SchedulerWorkload {
    pub fn new(queue: Arc<JobQueue>, pool: Arc<WorkerPool>) -> Self {
        Self { queue, pool }
    }
}

impl WorkloadProbe for SchedulerWorkload {
    fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    fn queue_capacity(&self) -> Option<usize> {
        self.queue.capacity()
    }

    fn active_workers(&self) -> usize {
        self.pool.size()
    }
}
