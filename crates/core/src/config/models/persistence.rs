use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// SQLite连接串，例如 sqlite://jobforge.db
    pub url: String,
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            url: "sqlite://jobforge.db".to_string(),
            max_connections: 4,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.backend == PersistenceBackend::Sqlite {
            if !self.url.starts_with("sqlite:") {
                return Err(SchedulerError::Configuration(format!(
                    "SQLite连接串格式无效: {}",
                    self.url
                )));
            }
            if self.max_connections == 0 {
                return Err(SchedulerError::Configuration(
                    "persistence.max_connections必须大于0".to_string(),
                ));
            }
        }
        Ok(())
    }
}
