//! 行情流消费者（I/O 核心）
//!
//! 状态机：DISCONNECTED → CONNECTING → OPEN → {CLOSED, ERRORED} → CONNECTING，
//! 收到关闭信号后进入 SHUTTING_DOWN → TERMINATED。
//! 断线后按有界指数退避 + 抖动重连，永不放弃；连续失败达到阈值时告警。
//!
//! 关闭顺序：停止读取 → 释放批次发送端 → 等待计算核心处理完已入队的批次并退出
//! → 发送关闭帧 → TERMINATED。排空本身在计算核心的主循环中完成。

use crate::frcommon::config::WebSocketConfig;
use crate::frcommon::models::TickBatch;
use crate::frcommon::websocket::{
    build_subscription_message, decode_mark_price_message, per_symbol_stream, ConnectionManager,
    ReconnectPolicy, WsCommand, WsStream, WEBSOCKET_CONNECTION_TARGET,
};
use crate::frcommon::{handle_error, AppError, ErrorPolicy};
use fastwebsockets::{Frame, OpCode};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// I/O 核心日志目标
pub const IO_TARGET: &str = "I/O核心";

/// 超过该时长没有收到数据时告警
const STALE_FEED_WARN: Duration = Duration::from_secs(120);

/// 关闭时等待计算核心排空的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Errored,
    ShuttingDown,
    Terminated,
}

impl ConsumerState {
    pub fn can_transition_to(&self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Errored)
                | (Open, Closed)
                | (Open, Errored)
                | (Closed, Connecting)
                | (Errored, Connecting)
                | (ShuttingDown, Terminated)
        ) || (next == ShuttingDown && !matches!(self, ShuttingDown | Terminated))
    }
}

/// 一次连接会话的结束方式
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Closed,
    Errored(AppError),
    EngineGone,
}

pub struct StreamConsumer {
    config: WebSocketConfig,
    connection: ConnectionManager,
    policy: ReconnectPolicy,
    /// 关闭时释放，计算核心据此得知不会再有新批次
    batch_tx: Option<mpsc::Sender<TickBatch>>,
    ws_cmd_rx: mpsc::Receiver<WsCommand>,
    state_tx: watch::Sender<ConsumerState>,
    state: ConsumerState,
    /// 按品种订阅模式下当前跟踪的品种
    tracked: Vec<String>,
    next_request_id: u64,
}

impl StreamConsumer {
    pub fn new(
        config: WebSocketConfig,
        batch_tx: mpsc::Sender<TickBatch>,
        ws_cmd_rx: mpsc::Receiver<WsCommand>,
        tracked: Vec<String>,
    ) -> (Self, watch::Receiver<ConsumerState>) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        let consumer = Self {
            connection: ConnectionManager::new(&config),
            policy: ReconnectPolicy::from_config(&config),
            config,
            batch_tx: Some(batch_tx),
            ws_cmd_rx,
            state_tx,
            state: ConsumerState::Disconnected,
            tracked,
            next_request_id: 1,
        };
        (consumer, state_rx)
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(target: IO_TARGET, from = ?self.state, to = ?next, "非预期的状态切换");
        }
        debug!(target: IO_TARGET, from = ?self.state, to = ?next, "状态切换");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// 本次连接需要订阅的流
    fn subscription_streams(&self) -> Vec<String> {
        if self.config.per_symbol_streams {
            self.tracked.iter().map(|s| per_symbol_stream(s)).collect()
        } else {
            self.config.streams.clone()
        }
    }

    async fn send_subscription(&mut self, ws: &mut WsStream, method: &str, streams: &[String]) -> Result<(), AppError> {
        if streams.is_empty() {
            return Ok(());
        }
        let msg = build_subscription_message(method, streams, self.next_request_id);
        self.next_request_id += 1;
        info!(
            target: WEBSOCKET_CONNECTION_TARGET,
            log_type = "low_freq",
            method,
            stream_count = streams.len(),
            "📤 发送订阅消息"
        );
        ws.write_frame(Frame::text(msg.into_bytes().into()))
            .await
            .map_err(|e| AppError::FeedDisconnectError(format!("发送{}失败: {}", method, e)))
    }

    async fn apply_command(&mut self, ws: &mut WsStream, cmd: WsCommand) -> Result<(), AppError> {
        match cmd {
            WsCommand::Subscribe(symbols) => {
                let new: Vec<String> = symbols
                    .into_iter()
                    .filter(|s| !self.tracked.contains(s))
                    .collect();
                self.tracked.extend(new.iter().cloned());
                if self.config.per_symbol_streams {
                    let streams: Vec<String> = new.iter().map(|s| per_symbol_stream(s)).collect();
                    self.send_subscription(ws, "SUBSCRIBE", &streams).await?;
                }
            }
            WsCommand::Unsubscribe(symbols) => {
                self.tracked.retain(|s| !symbols.contains(s));
                if self.config.per_symbol_streams {
                    let streams: Vec<String> = symbols.iter().map(|s| per_symbol_stream(s)).collect();
                    self.send_subscription(ws, "UNSUBSCRIBE", &streams).await?;
                }
            }
        }
        Ok(())
    }

    /// 把批次交给计算核心；计算核心已退出时返回 false
    async fn forward(&self, batch: TickBatch) -> bool {
        match &self.batch_tx {
            Some(tx) => tx.send(batch).await.is_ok(),
            None => false,
        }
    }

    /// 释放批次发送端并等待计算核心排空退出
    async fn release_and_drain<D: Future<Output = ()>>(&mut self, engine_drained: D) {
        drop(self.batch_tx.take());
        if tokio::time::timeout(DRAIN_TIMEOUT, engine_drained).await.is_err() {
            warn!(target: IO_TARGET, "等待计算核心排空超时");
        } else {
            debug!(target: IO_TARGET, "计算核心已排空");
        }
    }

    /// 一次连接会话的消息循环
    async fn run_session(
        &mut self,
        ws: &mut WsStream,
        shutdown_rx: &mut watch::Receiver<bool>,
        received: &mut u64,
    ) -> SessionEnd {
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);
        let mut status_interval = tokio::time::interval(Duration::from_secs(30));
        let mut last_message_time = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return SessionEnd::Shutdown,

                Some(cmd) = self.ws_cmd_rx.recv() => {
                    if let Err(e) = self.apply_command(ws, cmd).await {
                        return SessionEnd::Errored(e);
                    }
                },

                result = tokio::time::timeout(read_timeout, ws.read_frame()) => match result {
                    Err(_) => {
                        debug!(target: WEBSOCKET_CONNECTION_TARGET, "读取空闲超时，发送Ping");
                        if let Err(e) = ws.write_frame(Frame::new(true, OpCode::Ping, None, Vec::new().into())).await {
                            return SessionEnd::Errored(AppError::FeedDisconnectError(format!("发送Ping失败: {}", e)));
                        }
                    }
                    Ok(Err(e)) => {
                        return SessionEnd::Errored(AppError::FeedDisconnectError(format!("读取失败: {}", e)));
                    }
                    Ok(Ok(frame)) => match frame.opcode {
                        OpCode::Text => {
                            last_message_time = Instant::now();
                            *received += 1;
                            match decode_mark_price_message(&frame.payload) {
                                Ok(Some(batch)) => {
                                    if !self.forward(batch).await {
                                        return SessionEnd::EngineGone;
                                    }
                                }
                                Ok(None) => debug!(target: WEBSOCKET_CONNECTION_TARGET, "收到订阅回执"),
                                Err(e) => {
                                    handle_error(&e, "解码行情消息");
                                }
                            }
                        }
                        OpCode::Ping => {
                            debug!(target: WEBSOCKET_CONNECTION_TARGET, "收到Ping，发送Pong");
                            let pong = Frame::pong(frame.payload.to_vec().into());
                            if let Err(e) = ws.write_frame(pong).await {
                                return SessionEnd::Errored(AppError::FeedDisconnectError(format!("发送Pong失败: {}", e)));
                            }
                        }
                        OpCode::Pong => debug!(target: WEBSOCKET_CONNECTION_TARGET, "收到Pong"),
                        OpCode::Close => {
                            info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", "收到关闭帧");
                            return SessionEnd::Closed;
                        }
                        _ => debug!(target: WEBSOCKET_CONNECTION_TARGET, "忽略其他类型的帧"),
                    },
                },

                _ = status_interval.tick() => {
                    if last_message_time.elapsed() > STALE_FEED_WARN {
                        warn!(target: WEBSOCKET_CONNECTION_TARGET, "⚠️ 超过2分钟未收到消息，连接可能异常");
                    }
                },
            }
        }
    }

    /// I/O 核心主循环，直到收到关闭信号或计算核心消失
    ///
    /// `engine_drained` 在计算核心处理完全部已入队批次并退出后完成。
    #[instrument(target = "I/O核心", skip_all, name = "run_io_loop")]
    pub async fn run<D>(mut self, mut shutdown_rx: watch::Receiver<bool>, engine_drained: D)
    where
        D: Future<Output = ()>,
    {
        let mut engine_drained = Some(engine_drained);
        let mut attempt: u32 = 0;
        let mut consecutive_failures: u32 = 0;

        'reconnect: loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.transition(ConsumerState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'reconnect,
                result = self.connection.connect() => result,
            };

            match connected {
                Ok(mut ws) => {
                    self.transition(ConsumerState::Open);
                    info!(target: IO_TARGET, log_type = "low_freq", attempt, "✅ 行情连接已建立");

                    let mut received = 0u64;
                    let streams = self.subscription_streams();
                    let end = match self.send_subscription(&mut ws, "SUBSCRIBE", &streams).await {
                        Ok(()) => self.run_session(&mut ws, &mut shutdown_rx, &mut received).await,
                        Err(e) => SessionEnd::Errored(e),
                    };

                    if received > 0 {
                        attempt = 0;
                        consecutive_failures = 0;
                    }

                    match end {
                        SessionEnd::Shutdown | SessionEnd::EngineGone => {
                            self.transition(ConsumerState::ShuttingDown);
                            if let Some(drained) = engine_drained.take() {
                                self.release_and_drain(drained).await;
                            }
                            if let Err(e) = ws.write_frame(Frame::close(1000, b"shutdown")).await {
                                debug!(target: IO_TARGET, "发送关闭帧失败: {}", e);
                            }
                            break 'reconnect;
                        }
                        SessionEnd::Closed => {
                            self.transition(ConsumerState::Closed);
                            warn!(target: IO_TARGET, received, "行情连接被对端关闭");
                        }
                        SessionEnd::Errored(e) => {
                            self.transition(ConsumerState::Errored);
                            if handle_error(&e, "行情会话") == ErrorPolicy::Escalate {
                                break 'reconnect;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.transition(ConsumerState::Errored);
                    if handle_error(&e, "建立行情连接") == ErrorPolicy::Escalate {
                        break 'reconnect;
                    }
                }
            }

            consecutive_failures = consecutive_failures.saturating_add(1);
            if self.policy.should_alert(consecutive_failures) {
                error!(
                    target: IO_TARGET,
                    consecutive_failures,
                    "🚨 行情连接连续失败，继续重试"
                );
            }

            let delay = self.policy.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            info!(target: IO_TARGET, ?delay, attempt, "等待后重连");

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'reconnect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConsumerState::ShuttingDown);
        if let Some(drained) = engine_drained.take() {
            self.release_and_drain(drained).await;
        }
        self.transition(ConsumerState::Terminated);
        info!(target: IO_TARGET, log_type = "low_freq", "I/O核心已终止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConsumerState::*;

    #[test]
    fn test_state_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closed));
        assert!(Open.can_transition_to(Errored));
        assert!(Closed.can_transition_to(Connecting));
        assert!(Errored.can_transition_to(Connecting));
        assert!(Open.can_transition_to(ShuttingDown));
        assert!(Errored.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Terminated));

        assert!(!Disconnected.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Terminated.can_transition_to(Connecting));
        assert!(!Terminated.can_transition_to(ShuttingDown));
    }

    /// 关闭信号先于连接完成时：先释放批次发送端，等计算核心排空后才进入 TERMINATED
    #[tokio::test]
    async fn test_shutdown_waits_for_engine_drain() {
        let config = WebSocketConfig::default();
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let (_ws_cmd_tx, ws_cmd_rx) = mpsc::channel(4);
        let (consumer, mut state_rx) = StreamConsumer::new(config, batch_tx, ws_cmd_rx, Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(consumer.run(shutdown_rx, async move {
            let _ = drained_rx.await;
        }));

        // 发送端释放后，计算核心读到通道关闭
        let closed = tokio::time::timeout(Duration::from_secs(5), batch_rx.recv())
            .await
            .expect("批次发送端应及时释放");
        assert!(closed.is_none(), "批次通道应已关闭");
        assert_eq!(*state_rx.borrow_and_update(), ShuttingDown, "排空完成前不应终止");

        drained_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("消费者应及时退出")
            .unwrap();
        assert_eq!(*state_rx.borrow_and_update(), Terminated);
        drop(shutdown_tx);
        println!("✅ 关闭顺序测试通过");
    }
}
