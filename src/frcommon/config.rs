//! 资金费率聚合系统配置模块

use crate::frcommon::{AppError, Result};
use serde::{Deserialize, Serialize};

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/FundingRateConfig.toml";

    /// 全市场标记价格流
    pub const DEFAULT_MARK_PRICE_STREAM: &str = "!markPrice@arr";

    /// 1分钟桶的默认 tick 数量阈值
    pub const DEFAULT_FLUSH_TICK_THRESHOLD: usize = 20;

    /// 小时聚合读取的5分钟行数
    pub const DEFAULT_HOURLY_WINDOW: usize = 12;

    /// 日聚合读取的小时行数
    pub const DEFAULT_DAILY_WINDOW: usize = 24;
}

use constants::*;

/// 资金费率聚合系统配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FundingRateConfig {
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,

    /// WebSocket配置
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// 聚合配置
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// 品种对账配置
    #[serde(default)]
    pub registry: RegistryConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 获取连接超时（秒）
    pub connection_timeout_secs: u64,
    /// 是否启用WAL模式
    pub enable_wal: bool,
}

/// WebSocket配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
    /// 组合流订阅列表
    pub streams: Vec<String>,
    /// 为每个品种单独订阅 `<symbol>@markPrice`
    pub per_symbol_streams: bool,
    /// 是否使用代理
    pub use_proxy: bool,
    /// 代理地址
    pub proxy_host: String,
    /// 代理端口
    pub proxy_port: u16,
    /// 单次建连超时（秒）
    pub connect_timeout_secs: u64,
    /// 读空闲超时（秒），超时后发送 Ping
    pub read_timeout_secs: u64,
    /// 重连退避基数（毫秒）
    pub reconnect_base_delay_ms: u64,
    /// 重连退避上限（毫秒）
    pub reconnect_max_delay_ms: u64,
    /// 连续失败多少次后告警（不会停止重连）
    pub reconnect_alert_threshold: u32,
}

/// 聚合配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// 1分钟桶的 tick 数量阈值
    pub flush_tick_threshold: usize,
    /// 小时聚合窗口（5分钟行数）
    pub hourly_window: usize,
    /// 日聚合窗口（小时行数）
    pub daily_window: usize,
    /// 消息通道容量
    pub channel_capacity: usize,
    /// 统计日志间隔（秒）
    pub stats_interval_secs: u64,
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// 每次读写的超时（秒）
    pub write_timeout_secs: u64,
}

/// 品种对账配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 周期性对账间隔（秒）
    pub reconcile_interval_secs: u64,
    /// 启动阶段获取品种列表失败后的重试间隔（毫秒）
    pub startup_retry_delay_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)，可被 RUST_LOG 覆盖
    pub log_level: String,
    /// 日志目录
    pub log_dir: String,
    /// 日志文件前缀
    pub log_file_prefix: String,
    /// 是否输出JSON格式
    pub json_format: bool,
    /// 是否启用控制台输出
    pub enable_console_output: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/funding_rate.db".to_string(),
            pool_size: 4,
            connection_timeout_secs: 10,
            enable_wal: true,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "fstream.binance.com".to_string(),
            port: 443,
            streams: vec![DEFAULT_MARK_PRICE_STREAM.to_string()],
            per_symbol_streams: false,
            use_proxy: false,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 1080,
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_alert_threshold: 10,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            flush_tick_threshold: DEFAULT_FLUSH_TICK_THRESHOLD,
            hourly_window: DEFAULT_HOURLY_WINDOW,
            daily_window: DEFAULT_DAILY_WINDOW,
            channel_capacity: 1024,
            stats_interval_secs: 60,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { write_timeout_secs: 5 }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 3_600,
            startup_retry_delay_ms: 1_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            log_file_prefix: "funding_rate.log".to_string(),
            json_format: false,
            enable_console_output: true,
        }
    }
}

impl FundingRateConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML文本解析配置并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.flush_tick_threshold == 0 {
            return Err(AppError::ConfigError("tick数量阈值必须大于0".to_string()));
        }
        if agg.hourly_window == 0 || agg.daily_window == 0 {
            return Err(AppError::ConfigError("小时/日聚合窗口必须大于0".to_string()));
        }
        if agg.channel_capacity == 0 {
            return Err(AppError::ConfigError("通道容量必须大于0".to_string()));
        }

        let ws = &self.websocket;
        if ws.reconnect_base_delay_ms == 0 || ws.reconnect_base_delay_ms > ws.reconnect_max_delay_ms {
            return Err(AppError::ConfigError(format!(
                "重连退避参数无效: base={}ms, max={}ms",
                ws.reconnect_base_delay_ms, ws.reconnect_max_delay_ms
            )));
        }
        if ws.connect_timeout_secs == 0 || ws.read_timeout_secs == 0 {
            return Err(AppError::ConfigError("WebSocket超时必须大于0".to_string()));
        }
        if !ws.per_symbol_streams && ws.streams.is_empty() {
            return Err(AppError::ConfigError("未启用按品种订阅时，streams不能为空".to_string()));
        }

        if self.persistence.write_timeout_secs == 0 {
            return Err(AppError::ConfigError("持久化超时必须大于0".to_string()));
        }
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }
        if self.registry.reconcile_interval_secs == 0 {
            return Err(AppError::ConfigError("对账间隔必须大于0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FundingRateConfig::from_toml_str("").expect("空配置应使用默认值");
        assert_eq!(config.aggregation.flush_tick_threshold, 20);
        assert_eq!(config.aggregation.hourly_window, 12);
        assert_eq!(config.aggregation.daily_window, 24);
        assert_eq!(config.websocket.streams, vec!["!markPrice@arr".to_string()]);
    }

    #[test]
    fn test_partial_section_override() {
        let config = FundingRateConfig::from_toml_str(
            "[aggregation]\nflush_tick_threshold = 5\n\n[websocket]\nuse_proxy = true\nproxy_port = 7890\n",
        )
        .expect("配置应解析成功");
        assert_eq!(config.aggregation.flush_tick_threshold, 5);
        assert_eq!(config.aggregation.hourly_window, 12);
        assert!(config.websocket.use_proxy);
        assert_eq!(config.websocket.proxy_port, 7890);
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let err = FundingRateConfig::from_toml_str(
            "[websocket]\nreconnect_base_delay_ms = 5000\nreconnect_max_delay_ms = 1000\n",
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = FundingRateConfig::default();
        config.aggregation.flush_tick_threshold = 0;
        assert!(config.validate().is_err());
    }
}
