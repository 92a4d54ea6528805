use std::collections::HashMap;

use async_trait::async_trait;
use jobforge_core::SchedulerResult;
use jobforge_domain::{Job, JobId, JobStore};
use tokio::sync::RwLock;
use tracing::debug;

/// 进程内任务存储，重启后数据丢失
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &Job) -> SchedulerResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&job.id) {
            Some(existing) if existing.revision > job.revision => {
                debug!(
                    "忽略过期写入: {} (已存储revision {} > {})",
                    job.id, existing.revision, job.revision
                );
            }
            _ => {
                jobs.insert(job.id, job.clone());
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> SchedulerResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn load_all(&self) -> SchedulerResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(jobs)
    }

    async fn delete(&self, id: JobId) -> SchedulerResult<bool> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }
}
