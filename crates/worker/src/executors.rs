use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{ExecutionContext, JobExecutor};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellJobParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Shell任务执行器
///
/// 子进程以 `kill_on_drop` 启动，取消令牌触发时放弃等待并终止子进程。
/// 非零退出码视为可重试的瞬时失败。
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> SchedulerResult<serde_json::Value> {
        let params: ShellJobParams = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| SchedulerError::validation(format!("解析Shell任务参数失败: {e}")))?;

        info!(
            "执行Shell任务: job_id={}, attempt={}, command={}, args={:?}",
            ctx.job_id, ctx.attempt, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SchedulerError::validation(format!("命令不存在: {}", params.command))
            } else {
                SchedulerError::transient(format!("启动Shell命令失败: {e}"))
            }
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| SchedulerError::transient(format!("等待进程结束失败: {e}")))?,
            _ = ctx.cancellation.cancelled() => {
                warn!("Shell任务被取消: job_id={}", ctx.job_id);
                return Err(SchedulerError::Cancelled);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();

        debug!(
            "Shell任务结束: job_id={}, exit_code={:?}, duration={}ms",
            ctx.job_id, exit_code, duration_ms
        );

        if !output.status.success() {
            let detail = if stderr.is_empty() {
                format!("退出码: {exit_code:?}")
            } else {
                stderr
            };
            return Err(SchedulerError::transient(format!(
                "命令执行失败 ({}): {detail}",
                params.command
            )));
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "duration_ms": duration_ms,
        }))
    }

    fn name(&self) -> &str {
        "shell"
    }
}

/// 回显执行器，原样返回载荷，可用 `sleep_ms` 模拟耗时
#[derive(Debug, Default)]
pub struct EchoExecutor;

impl EchoExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobExecutor for EchoExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> SchedulerResult<serde_json::Value> {
        if let Some(sleep_ms) = ctx.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                _ = ctx.cancellation.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
        Ok(json!({
            "echo": ctx.payload,
            "attempt": ctx.attempt,
            "worker_id": ctx.worker_id,
        }))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_testing_utils::JobBuilder;
    use tokio_util::sync::CancellationToken;

    fn context(job_type: &str, payload: serde_json::Value) -> ExecutionContext {
        let job = JobBuilder::new(job_type).with_payload(payload).build();
        ExecutionContext::for_job(&job, "worker-1", Duration::from_secs(5), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let result = EchoExecutor::new()
            .execute(context("echo", json!({"frame": 7})))
            .await
            .unwrap();
        assert_eq!(result["echo"]["frame"], 7);
        assert_eq!(result["worker_id"], "worker-1");
    }

    #[tokio::test]
    async fn test_echo_sleep_honours_cancellation() {
        let ctx = context("echo", json!({"sleep_ms": 60_000}));
        ctx.cancellation.cancel();
        let result = EchoExecutor::new().execute(ctx).await;
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shell_rejects_invalid_payload() {
        let result = ShellExecutor::new()
            .execute(context("shell", json!({"args": ["x"]})))
            .await;
        let err = result.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runs_command() {
        let result = ShellExecutor::new()
            .execute(context(
                "shell",
                json!({"command": "sh", "args": ["-c", "echo $GREETING"], "env": {"GREETING": "hello"}}),
            ))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_non_zero_exit_is_retryable() {
        let err = ShellExecutor::new()
            .execute(context("shell", json!({"command": "sh", "args": ["-c", "exit 3"]})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_cancellation_stops_waiting() {
        let ctx = context("shell", json!({"command": "sleep", "args": ["30"]}));
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = Instant::now();
        let result = ShellExecutor::new().execute(ctx).await;
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
