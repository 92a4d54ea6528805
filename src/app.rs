use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobforge_core::config::{AppConfig, ObservabilityConfig};
use jobforge_dispatcher::Scheduler;
use jobforge_domain::JobSpec;
use jobforge_worker::{EchoExecutor, ExecutorRegistry, ShellExecutor};
use tracing::{info, warn};

/// 主应用程序
pub struct Application {
    scheduler: Arc<Scheduler>,
}

impl Application {
    /// 按配置装配调度器与内置执行器
    pub async fn new(config: AppConfig) -> Result<Self> {
        if config.observability.prometheus_enabled {
            init_metrics_exporter(&config.observability)?;
        }

        let scheduler = Scheduler::builder(config)
            .with_executors(builtin_executors())
            .build()
            .await
            .context("创建调度器失败")?;

        Ok(Self {
            scheduler: Arc::new(scheduler),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let report = self.scheduler.start().await.context("启动调度器失败")?;
        info!(
            "启动恢复: 重新入队 {} 个, 中断恢复 {} 个, 失败 {} 个",
            report.requeued.len(),
            report.interrupted.len(),
            report.failed.len()
        );
        Ok(())
    }

    /// 提交任务文件中的全部任务，返回成功提交的数量
    pub async fn submit_jobs_file(&self, path: &Path) -> Result<usize> {
        let specs = load_job_specs(path).await?;
        let total = specs.len();
        let mut submitted = 0;
        for spec in specs {
            let job_type = spec.job_type.clone();
            match self.scheduler.submit(spec).await {
                Ok(id) => {
                    submitted += 1;
                    info!("已提交 {} 任务: {}", job_type, id);
                }
                Err(e) => warn!("提交 {} 任务失败: {}", job_type, e),
            }
        }
        if submitted < total {
            warn!("{} 个任务中有 {} 个提交失败", total, total - submitted);
        }
        Ok(submitted)
    }

    pub async fn shutdown(&self) {
        let report = self.scheduler.shutdown().await;
        let stats = self.scheduler.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            retried = stats.retried,
            queue_depth = stats.queue_depth,
            throughput = stats.throughput,
            "最终统计"
        );
        if !report.is_clean() {
            warn!("{} 个Worker被强制中止，未完成的任务将在下次启动时恢复", report.aborted);
        }
    }
}

fn builtin_executors() -> Arc<ExecutorRegistry> {
    let executors = Arc::new(ExecutorRegistry::new());
    executors.register("shell", Arc::new(ShellExecutor::new()));
    executors.register("echo", Arc::new(EchoExecutor::new()));
    executors
}

fn init_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    let address: SocketAddr = config
        .prometheus_bind_address
        .parse()
        .with_context(|| format!("无效的Prometheus监听地址: {}", config.prometheus_bind_address))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出已启用: http://{}/metrics", address);
    Ok(())
}

async fn load_job_specs(path: &Path) -> Result<Vec<JobSpec>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取任务文件失败: {}", path.display()))?;
    parse_job_specs(&text).with_context(|| format!("解析任务文件失败: {}", path.display()))
}

fn parse_job_specs(text: &str) -> Result<Vec<JobSpec>> {
    Ok(serde_json::from_str(text)?)
}
