//! 日志系统初始化模块
//!
//! 文件日志按天滚动（非阻塞写入），控制台输出可选。
//! 过滤规则优先取 RUST_LOG，否则使用配置中的日志级别。

use crate::frcommon::config::LoggingConfig;
use crate::frcommon::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 组装过滤字符串，压低第三方库的噪音
pub fn build_filter_string(log_level: &str) -> String {
    std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("{},hyper=warn,rusqlite=warn,r2d2=warn", log_level))
}

/// 初始化日志系统，返回的 guard 必须由 main 持有到进程结束
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(file_writer)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(file_writer)
            .boxed()
    };

    // 未启用时层为 None，.with(None) 是无操作的
    let console_layer = config
        .enable_console_output
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stdout));

    Registry::default()
        .with(EnvFilter::new(build_filter_string(&config.log_level)))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("初始化日志系统失败: {}", e)))?;

    tracing::info!(
        target: "应用生命周期",
        log_type = "low_freq",
        log_dir = %config.log_dir,
        json = config.json_format,
        "日志系统初始化完成"
    );

    Ok(guard)
}
