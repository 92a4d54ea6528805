use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use jobforge_core::config::{AppConfig, LogFormat};
use jobforge_core::init_logging;
use tracing::{info, warn};

mod app;
mod shutdown;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobforge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("资源感知的批处理任务调度引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找默认位置"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("FILE")
                .help("启动后提交的任务文件（JobSpec的JSON数组）"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("<默认位置>")
        )
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = match format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }
    init_logging(&config.observability).context("初始化日志失败")?;

    info!("启动jobforge {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let app = Application::new(config).await?;
    app.start().await?;

    if let Some(path) = matches.get_one::<String>("jobs") {
        match app.submit_jobs_file(&PathBuf::from(path)).await {
            Ok(count) => info!("已从 {} 提交 {} 个任务", path, count),
            Err(e) => warn!("提交任务文件 {} 失败: {:#}", path, e),
        }
    }

    let signal = shutdown::wait_for_shutdown_signal().await;
    info!("收到{signal}信号，开始优雅关闭...");

    app.shutdown().await;
    info!("jobforge已退出");
    Ok(())
}
