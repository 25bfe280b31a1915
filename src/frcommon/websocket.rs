// 文件: src/frcommon/websocket.rs
// WebSocket模块 - 币安标记价格流的连接、订阅消息、解码与重连退避 (使用 fastwebsockets 实现)
use crate::frcommon::boundary::millis_to_secs;
use crate::frcommon::config::WebSocketConfig;
use crate::frcommon::models::{Tick, TickBatch};
use crate::frcommon::{AppError, Result};
use rand::Rng;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::json;
use serde_json::value::RawValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info};

use bytes::Bytes;
use fastwebsockets::FragmentCollector;
use http_body_util::Empty;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper_util::rt::tokio::TokioIo;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, ServerName};
use tokio_rustls::TlsConnector;

//=============================================================================
// 常量
//=============================================================================

/// WebSocket连接日志目标
pub const WEBSOCKET_CONNECTION_TARGET: &str = "websocket连接";

/// 组合流端点
pub const COMBINED_STREAM_PATH: &str = "/stream";

pub type WsStream = FragmentCollector<TokioIo<Upgraded>>;

/// 发往 I/O 任务的订阅命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// 单品种标记价格流名称
pub fn per_symbol_stream(symbol: &str) -> String {
    format!("{}@markPrice", symbol.to_lowercase())
}

/// 构造 SUBSCRIBE / UNSUBSCRIBE 请求体
pub fn build_subscription_message(method: &str, streams: &[String], id: u64) -> String {
    json!({
        "method": method,
        "params": streams,
        "id": id,
    })
    .to_string()
}

//=============================================================================
// 消息解码
//=============================================================================

/// 组合流信封：{"stream": "...", "data": [...]}，订阅回执没有 data 字段
#[derive(Deserialize)]
struct CombinedStreamPayload<'a> {
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(default)]
    id: Option<serde_json::Value>,
}

/// 单个标记价格事件，币安的数值字段是字符串
#[derive(Deserialize)]
struct RawMarkPrice {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "T", default)]
    transaction_time_ms: Option<i64>,
    #[serde(rename = "r", deserialize_with = "de_lenient_f64")]
    funding_rate: f64,
    #[serde(rename = "p", deserialize_with = "de_lenient_f64")]
    mark_price: f64,
    #[serde(rename = "i", deserialize_with = "de_lenient_f64")]
    index_price: f64,
}

/// 同时接受 "0.00010000" 与 0.0001
fn de_lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(v) => Ok(v),
        NumOrString::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| de::Error::custom(format!("无效数值 {:?}: {}", s, e))),
    }
}

impl RawMarkPrice {
    fn into_tick(self) -> Tick {
        let event_time = millis_to_secs(self.event_time_ms);
        let transaction_time = self
            .transaction_time_ms
            .filter(|t| *t > 0)
            .map(millis_to_secs)
            .unwrap_or(event_time);

        Tick {
            symbol: self.symbol,
            event_time,
            transaction_time,
            funding_rate: self.funding_rate,
            mark_price: self.mark_price,
            index_price: self.index_price,
        }
    }
}

/// 解码一条入站消息
///
/// - 订阅回执返回 `Ok(None)`
/// - 信封本身无法解析返回 `MalformedMessageError`
/// - `data` 中的元素逐个解码，坏元素只计数不影响同批其他元素
pub fn decode_mark_price_message(payload: &[u8]) -> Result<Option<TickBatch>> {
    let envelope: CombinedStreamPayload = serde_json::from_slice(payload)
        .map_err(|e| AppError::MalformedMessageError(format!("信封解析失败: {}", e)))?;

    let data = match (envelope.data, envelope.id) {
        (Some(data), _) => data,
        (None, Some(_)) => return Ok(None),
        (None, None) => {
            return Err(AppError::MalformedMessageError("消息缺少 data 字段".to_string()))
        }
    };

    let elements: Vec<&RawValue> = if data.get().trim_start().starts_with('[') {
        serde_json::from_str(data.get())
            .map_err(|e| AppError::MalformedMessageError(format!("data 数组解析失败: {}", e)))?
    } else {
        vec![data]
    };

    let mut batch = TickBatch {
        ticks: Vec::with_capacity(elements.len()),
        malformed: 0,
    };
    for element in elements {
        match serde_json::from_str::<RawMarkPrice>(element.get()) {
            Ok(raw) => batch.ticks.push(raw.into_tick()),
            Err(e) => {
                batch.malformed += 1;
                debug!(target: WEBSOCKET_CONNECTION_TARGET, error = %e, "丢弃无法解码的元素");
            }
        }
    }

    Ok(Some(batch))
}

//=============================================================================
// 重连退避
//=============================================================================

/// 有界指数退避 + 抖动，连续失败达到阈值时告警，但永不放弃
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub alert_threshold: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &WebSocketConfig) -> Self {
        Self {
            base_delay_ms: config.reconnect_base_delay_ms,
            max_delay_ms: config.reconnect_max_delay_ms,
            alert_threshold: config.reconnect_alert_threshold,
        }
    }

    /// 第 attempt 次重试的退避上限：min(base * 2^attempt, max)
    pub fn ceiling_ms(&self, attempt: u32) -> u64 {
        let multiplier = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }

    /// 实际等待时间从 [ceiling/2, ceiling] 中均匀抽取
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_ms(attempt);
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(jittered)
    }

    /// 连续失败次数每达到阈值的整数倍告警一次
    pub fn should_alert(&self, consecutive_failures: u32) -> bool {
        self.alert_threshold > 0
            && consecutive_failures >= self.alert_threshold
            && consecutive_failures % self.alert_threshold == 0
    }
}

//=============================================================================
// 连接管理
//=============================================================================

struct SpawnExecutor;

impl<Fut> hyper::rt::Executor<Fut> for SpawnExecutor
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    fn execute(&self, fut: Fut) {
        tokio::task::spawn(fut);
    }
}

/// WebSocket连接管理器，只负责建立连接，订阅由调用者在连接成功后发送
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    host: String,
    port: u16,
    use_proxy: bool,
    proxy_addr: String,
    proxy_port: u16,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(config: &WebSocketConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            use_proxy: config.use_proxy,
            proxy_addr: config.proxy_host.clone(),
            proxy_port: config.proxy_port,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// 建立一次连接，整体受连接超时约束
    pub async fn connect(&self) -> Result<WsStream> {
        match tokio::time::timeout(self.connect_timeout, self.connect_once()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::FeedDisconnectError(format!(
                "连接超时 ({}s)",
                self.connect_timeout.as_secs()
            ))),
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        let host = self.host.as_str();
        let port = self.port;
        info!(
            target: WEBSOCKET_CONNECTION_TARGET,
            log_type = "low_freq",
            "🔗 连接 wss://{}:{}{} (代理: 启用={}, 地址={}:{})",
            host,
            port,
            COMBINED_STREAM_PATH,
            self.use_proxy,
            self.proxy_addr,
            self.proxy_port
        );

        // 建立TCP连接（通过代理或直接）
        let tcp_stream = if self.use_proxy {
            Socks5Stream::connect((self.proxy_addr.as_str(), self.proxy_port), (host, port))
                .await
                .map_err(|e| AppError::FeedDisconnectError(format!("代理连接失败: {}", e)))?
                .into_inner()
        } else {
            TcpStream::connect((host, port))
                .await
                .map_err(|e| AppError::FeedDisconnectError(format!("TCP连接失败: {}", e)))?
        };
        debug!(target: WEBSOCKET_CONNECTION_TARGET, "✅ TCP连接已建立");

        // 创建 TLS 连接
        let mut root_store = tokio_rustls::rustls::RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let tls_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host)
            .map_err(|_| AppError::WebSocketError(format!("无效的域名: {}", host)))?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| AppError::FeedDisconnectError(format!("TLS握手失败: {}", e)))?;
        debug!(target: WEBSOCKET_CONNECTION_TARGET, "✅ TLS连接已建立");

        let req = Request::builder()
            .method("GET")
            .uri(format!("https://{}{}", host, COMBINED_STREAM_PATH))
            .header("Host", host)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "upgrade")
            .header("Sec-WebSocket-Key", fastwebsockets::handshake::generate_key())
            .header("Sec-WebSocket-Version", "13")
            .body(Empty::<Bytes>::new())
            .map_err(|e| AppError::WebSocketError(format!("创建HTTP请求失败: {}", e)))?;

        let (ws, _) = fastwebsockets::handshake::client(&SpawnExecutor, req, tls_stream)
            .await
            .map_err(|e| AppError::FeedDisconnectError(format!("WebSocket握手失败: {}", e)))?;
        debug!(target: WEBSOCKET_CONNECTION_TARGET, "WebSocket握手成功");

        Ok(FragmentCollector::new(ws))
    }
}
