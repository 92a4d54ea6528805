use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::JobExecutor;
use tracing::info;

/// 按任务类型查找执行器，未注册的类型可回退到默认执行器
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn JobExecutor>>>,
    default_executor: RwLock<Option<Arc<dyn JobExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        let job_type = job_type.into();
        info!("注册执行器 '{}' -> 任务类型 '{}'", executor.name(), job_type);
        self.executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_type, executor);
    }

    pub fn set_default(&self, executor: Arc<dyn JobExecutor>) {
        info!("设置默认执行器: {}", executor.name());
        *self
            .default_executor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(executor);
    }

    /// 取得能处理该类型的执行器
    pub fn resolve(&self, job_type: &str) -> SchedulerResult<Arc<dyn JobExecutor>> {
        if let Some(executor) = self
            .executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_type)
        {
            return Ok(executor.clone());
        }

        self.default_executor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|executor| executor.supports_job_type(job_type))
            .cloned()
            .ok_or_else(|| SchedulerError::UnsupportedJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.resolve(job_type).is_ok()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_testing_utils::ScriptedExecutor;

    #[test]
    fn test_resolve_registered_and_default() {
        let registry = ExecutorRegistry::new();
        registry.register("shell", Arc::new(ScriptedExecutor::always_ok("shell")));

        assert_eq!(registry.resolve("shell").unwrap().name(), "shell");
        assert!(matches!(
            registry.resolve("gpu"),
            Err(SchedulerError::UnsupportedJobType(t)) if t == "gpu"
        ));

        registry.set_default(Arc::new(ScriptedExecutor::always_ok("fallback")));
        assert_eq!(registry.resolve("gpu").unwrap().name(), "fallback");
        assert_eq!(registry.job_types(), vec!["shell".to_string()]);
    }
}
