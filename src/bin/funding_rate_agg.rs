//! 启动资金费率聚合服务。
//!
//! ## 执行模型
//! - I/O 核心（`StreamConsumer`）维护行情连接，把每条消息解码为一个批次发给计算核心。
//! - 计算核心（`AggregationEngine`）是唯一持有品种状态的任务，按到达顺序处理批次。
//! - 品种管理器周期性对账，通过命令通道调整计算核心可处理的品种。
//! - 收到 Ctrl+C / SIGTERM 后广播关闭信号：I/O 核心停止接收并释放批次发送端，
//!   计算核心处理完已入队的批次后退出，I/O 核心随后关闭连接。

use anyhow::Result;
use clap::Parser;
use funding_rate_server::fragg::{
    symbol_registry::apply_to_engine, AggregationEngine, PersistenceClient, StreamConsumer,
    SymbolRegistry,
};
use funding_rate_server::frcommon::{
    config::constants::DEFAULT_CONFIG_PATH, logging_setup::init_logging, FundingRateConfig,
    PersistenceGateway, SqliteGateway,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;
use tracing::{error, info, instrument, span, warn, Instrument, Level};

const LIFECYCLE_TARGET: &str = "应用生命周期";

/// 关闭阶段等待各任务退出的上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "funding_rate_agg", about = "币安资金费率/标记价格聚合服务")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FundingRateConfig::from_file(&cli.config)?;

    // 日志系统必须最先初始化，guard 持有到进程结束
    let _guard = init_logging(&config.logging)?;

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(target: LIFECYCLE_TARGET, panic_info = %panic_info, "程序发生未捕获的Panic，即将退出");
        original_hook(panic_info);
        std::process::exit(1);
    }));

    let io_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fr-worker")
        .build()?;

    let main_span = span!(target: LIFECYCLE_TARGET, Level::INFO, "funding_rate_app_lifecycle");
    let result = io_runtime.block_on(run_app(config).instrument(main_span));

    match &result {
        Err(e) => error!(target: LIFECYCLE_TARGET, error = ?e, "应用因顶层错误而异常退出"),
        Ok(()) => info!(target: LIFECYCLE_TARGET, log_type = "low_freq", "应用程序正常关闭"),
    }

    io_runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

#[instrument(target = "应用生命周期", skip_all)]
async fn run_app(config: FundingRateConfig) -> Result<()> {
    info!(
        target: LIFECYCLE_TARGET,
        log_type = "low_freq",
        database = %config.database.database_path,
        streams = ?config.websocket.streams,
        per_symbol_streams = config.websocket.per_symbol_streams,
        "资金费率聚合服务启动"
    );

    let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open(&config.database)?);
    let client = PersistenceClient::new(
        gateway,
        Duration::from_secs(config.persistence.write_timeout_secs),
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    // 1. 启动对账：阻塞直到拿到非空的品种列表
    let registry = SymbolRegistry::new(
        client.clone(),
        Duration::from_millis(config.registry.startup_retry_delay_ms),
    );
    let report = match registry.startup(&mut shutdown_rx).await {
        Some(report) => report,
        None => {
            info!(target: LIFECYCLE_TARGET, log_type = "low_freq", "启动阶段收到关闭信号");
            return Ok(());
        }
    };

    // 2. 计算核心
    let capacity = config.aggregation.channel_capacity;
    let (batch_tx, batch_rx) = mpsc::channel(capacity);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ws_cmd_tx, ws_cmd_rx) = mpsc::channel(16);

    let engine = AggregationEngine::new(client.clone(), &config.aggregation);
    let (drained_tx, drained_rx) = oneshot::channel::<()>();
    let engine_handle = tokio::spawn(
        async move {
            let stats = engine.run_aggregation_loop(batch_rx, cmd_rx).await;
            let _ = drained_tx.send(());
            stats
        }
        .in_current_span(),
    );

    let initial = apply_to_engine(&cmd_tx, &report)
        .await
        .ok_or_else(|| anyhow::anyhow!("计算核心在启动阶段退出"))?;

    // 3. I/O 核心
    let (consumer, mut state_rx) =
        StreamConsumer::new(config.websocket.clone(), batch_tx, ws_cmd_rx, initial.activated);
    let engine_drained = async move {
        let _ = drained_rx.await;
    };
    let mut consumer_handle = tokio::spawn(consumer.run(shutdown_rx.clone(), engine_drained));

    tokio::spawn(
        async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                info!(target: LIFECYCLE_TARGET, ?state, "行情消费者状态");
            }
        }
        .in_current_span(),
    );

    // 4. 周期对账
    let registry_handle = tokio::spawn(registry.run_periodic(
        Duration::from_secs(config.registry.reconcile_interval_secs),
        cmd_tx,
        ws_cmd_tx,
        shutdown_rx.clone(),
    ));

    // 5. 等待关闭信号；I/O 核心自行退出同样触发关闭
    let consumer_exited = tokio::select! {
        _ = shutdown_requested(&mut shutdown_rx) => false,
        _ = &mut consumer_handle => true,
    };
    if consumer_exited {
        error!(target: LIFECYCLE_TARGET, "I/O核心意外退出，触发关闭");
        let _ = shutdown_tx.send(true);
    }
    info!(target: LIFECYCLE_TARGET, log_type = "low_freq", "开始优雅关闭");

    // I/O 核心释放批次发送端并等计算核心排空后才关闭连接退出
    if !consumer_exited && tokio::time::timeout(SHUTDOWN_GRACE, consumer_handle).await.is_err() {
        warn!(target: LIFECYCLE_TARGET, "I/O核心未在限定时间内退出");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, registry_handle).await.is_err() {
        warn!(target: LIFECYCLE_TARGET, "品种管理器未在限定时间内退出");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, engine_handle).await {
        Ok(Ok(stats)) => info!(target: LIFECYCLE_TARGET, log_type = "low_freq", ?stats, "计算核心已退出"),
        Ok(Err(e)) => error!(target: LIFECYCLE_TARGET, error = %e, "计算核心异常退出"),
        Err(_) => warn!(target: LIFECYCLE_TARGET, "计算核心未在限定时间内退出"),
    }

    drop(shutdown_tx);
    Ok(())
}

async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// 监听 Ctrl+C 与 SIGTERM，收到后广播关闭信号
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(
        async move {
            wait_for_signal().await;
            info!(target: LIFECYCLE_TARGET, log_type = "low_freq", "收到关闭信号");
            let _ = shutdown_tx.send(true);
        }
        .in_current_span(),
    );
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        Err(e) => {
            warn!(target: LIFECYCLE_TARGET, error = %e, "无法注册SIGTERM，仅监听Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
