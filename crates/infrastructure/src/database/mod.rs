pub mod memory_job_store;
pub mod sqlite;

pub use memory_job_store::InMemoryJobStore;
pub use sqlite::{SqliteDatabase, SqliteJobStore};

use std::sync::Arc;

use jobforge_core::config::{PersistenceBackend, PersistenceConfig};
use jobforge_core::SchedulerResult;
use jobforge_domain::JobStore;
use tracing::info;

/// 按配置创建任务存储
pub async fn create_job_store(config: &PersistenceConfig) -> SchedulerResult<Arc<dyn JobStore>> {
    match config.backend {
        PersistenceBackend::Memory => {
            info!("使用内存任务存储");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
        PersistenceBackend::Sqlite => {
            let database = SqliteDatabase::connect(&config.url, config.max_connections).await?;
            database.migrate().await?;
            info!("使用SQLite任务存储: {}", config.url);
            Ok(Arc::new(SqliteJobStore::new(database.pool().clone())))
        }
    }
}
