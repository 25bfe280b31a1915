use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum AppError {
    /// 行情连接断开或出错，重连即可
    #[error("Feed disconnect error: {0}")]
    FeedDisconnectError(String),

    /// 单条消息无法解析或缺少必需字段
    #[error("Malformed message error: {0}")]
    MalformedMessageError(String),

    /// 单次写入/读取失败或超时
    #[error("Persistence write error: {0}")]
    PersistenceWriteError(String),

    /// 新品种建表失败，下一轮对账时重试
    #[error("Schema provision error: {0}")]
    SchemaProvisionError(String),

    /// 启动时无法获取品种列表
    #[error("Startup unavailable error: {0}")]
    StartupUnavailableError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// 每类错误对应的统一处置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// 退避后重试（连接、启动、建表）
    Retry,
    /// 丢弃当前消息或当前写入，继续运行
    Drop,
    /// 上报给生命周期管理者，由其决定是否停机
    Escalate,
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的错误分类
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::FeedDisconnectError(_) => "funding_feed_disconnected",
            AppError::WebSocketError(_) => "funding_feed_transport_failed",
            AppError::MalformedMessageError(_) => "funding_message_malformed",
            AppError::JsonError(_) => "funding_message_parsing_failed",
            AppError::PersistenceWriteError(_) => "bucket_persistence_failed",
            AppError::SqliteError(_) => "bucket_storage_operation_failed",
            AppError::DatabaseError(_) => "bucket_storage_unavailable",
            AppError::SchemaProvisionError(_) => "symbol_schema_provision_failed",
            AppError::StartupUnavailableError(_) => "symbol_list_unavailable",
            AppError::InvalidIdentifier(_) => "storage_identifier_rejected",
            AppError::IoError(_) => "service_io_failed",
            AppError::ConfigError(_) => "service_configuration_invalid",
            AppError::ChannelError(_) => "aggregation_pipeline_broken",
        }
    }

    /// 错误种类到处置策略的唯一映射
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            AppError::FeedDisconnectError(_)
            | AppError::WebSocketError(_)
            | AppError::IoError(_)
            | AppError::SchemaProvisionError(_)
            | AppError::StartupUnavailableError(_) => ErrorPolicy::Retry,

            AppError::MalformedMessageError(_)
            | AppError::JsonError(_)
            | AppError::PersistenceWriteError(_)
            | AppError::SqliteError(_)
            | AppError::DatabaseError(_)
            | AppError::InvalidIdentifier(_) => ErrorPolicy::Drop,

            AppError::ConfigError(_) | AppError::ChannelError(_) => ErrorPolicy::Escalate,
        }
    }
}

/// 统一的错误处置入口：按策略记录日志并把策略交还给调用方
pub fn handle_error(err: &AppError, context: &str) -> ErrorPolicy {
    let policy = err.policy();
    match policy {
        ErrorPolicy::Retry => warn!(
            target: "错误处置",
            context,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "可重试错误，稍后重试"
        ),
        ErrorPolicy::Drop => warn!(
            target: "错误处置",
            context,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "错误已丢弃，继续运行"
        ),
        ErrorPolicy::Escalate => error!(
            target: "错误处置",
            context,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "严重错误，上报生命周期管理者"
        ),
    }
    policy
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试每类错误的处置策略
    #[test]
    fn test_error_policy_mapping() {
        assert_eq!(AppError::FeedDisconnectError("x".into()).policy(), ErrorPolicy::Retry);
        assert_eq!(AppError::MalformedMessageError("x".into()).policy(), ErrorPolicy::Drop);
        assert_eq!(AppError::PersistenceWriteError("x".into()).policy(), ErrorPolicy::Drop);
        assert_eq!(AppError::SchemaProvisionError("x".into()).policy(), ErrorPolicy::Retry);
        assert_eq!(AppError::StartupUnavailableError("x".into()).policy(), ErrorPolicy::Retry);
        assert_eq!(AppError::ConfigError("x".into()).policy(), ErrorPolicy::Escalate);
    }

    #[test]
    fn test_handle_error_returns_policy() {
        let err = AppError::PersistenceWriteError("写入超时".into());
        assert_eq!(handle_error(&err, "单元测试"), ErrorPolicy::Drop);
        assert_eq!(err.get_error_type_summary(), "bucket_persistence_failed");
    }
}
