//! 品种管理器
//!
//! 把权威品种列表与已建表的品种对账：新品种先建好四个周期表才允许进入计算核心，
//! 从列表中消失的品种只标记下架，存储保留。

use super::persistence::PersistenceClient;
use super::{EngineCmd, MembershipChange};
use crate::frcommon::db::SymbolDiff;
use crate::frcommon::models::CoinListing;
use crate::frcommon::websocket::WsCommand;
use crate::frcommon::{handle_error, AppError, Result};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, instrument, warn};

/// 品种管理器日志目标
pub const SYMBOL_MANAGER_TARGET: &str = "品种管理器";

/// 一次对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 按 id 排序的权威品种列表
    pub canonical: Vec<CoinListing>,
    /// 本轮新建表成功的品种
    pub provisioned: Vec<String>,
    /// 本轮建表失败的品种，下一轮重试
    pub failed: Vec<String>,
    /// 已建表但不在权威列表中的品种
    pub removed: BTreeSet<String>,
}

impl ReconcileReport {
    /// 可进入计算核心的品种：权威列表中建表成功（或早已建表）的品种
    pub fn eligible(&self) -> Vec<String> {
        self.canonical
            .iter()
            .map(|c| c.symbol.clone())
            .filter(|s| !self.failed.contains(s))
            .collect()
    }
}

pub struct SymbolRegistry {
    client: PersistenceClient,
    startup_retry_delay: Duration,
}

impl SymbolRegistry {
    pub fn new(client: PersistenceClient, startup_retry_delay: Duration) -> Self {
        Self {
            client,
            startup_retry_delay,
        }
    }

    /// 对账一次：拉取权威列表，计算差异，为新增品种建表
    #[instrument(target = "品种管理器", skip(self), err)]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        // 只读取一次权威列表，差异与可处理品种都基于这份快照
        let canonical = self.client.fetch_symbol_list().await?;
        let existing = self.client.existing_symbols().await?;
        let diff = SymbolDiff::between(&canonical, &existing);

        let mut report = ReconcileReport {
            canonical,
            removed: diff.removed,
            ..Default::default()
        };

        for symbol in &diff.added {
            match self.client.provision_symbol(symbol).await {
                Ok(()) => report.provisioned.push(symbol.clone()),
                Err(e) => {
                    handle_error(&e, &format!("为 {} 建表", symbol));
                    report.failed.push(symbol.clone());
                }
            }
        }

        info!(
            target: SYMBOL_MANAGER_TARGET,
            log_type = "low_freq",
            canonical = report.canonical.len(),
            provisioned = report.provisioned.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "品种对账完成"
        );
        if !report.removed.is_empty() {
            warn!(target: SYMBOL_MANAGER_TARGET, removed = ?report.removed, "品种已不在权威列表中，存储保留");
        }
        Ok(report)
    }

    /// 启动对账：阻塞直到拿到非空的权威列表，失败按固定间隔无限重试。
    /// 等待期间收到关闭信号返回 None。
    pub async fn startup(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<ReconcileReport> {
        let mut attempt: u64 = 0;
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }

            let err = match self.reconcile().await {
                Ok(report) if !report.canonical.is_empty() => {
                    info!(
                        target: SYMBOL_MANAGER_TARGET,
                        log_type = "low_freq",
                        attempt,
                        eligible = report.eligible().len(),
                        "✅ 启动对账完成"
                    );
                    return Some(report);
                }
                Ok(_) => AppError::StartupUnavailableError("权威品种列表为空".to_string()),
                Err(e) => AppError::StartupUnavailableError(e.to_string()),
            };

            attempt += 1;
            handle_error(&err, &format!("启动对账第{}次", attempt));

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return None,
                _ = tokio::time::sleep(self.startup_retry_delay) => {}
            }
        }
    }

    /// 周期性对账，把结果交给计算核心；按品种订阅模式下同步订阅变化
    pub async fn run_periodic(
        self,
        interval: Duration,
        cmd_tx: mpsc::Sender<EngineCmd>,
        ws_cmd_tx: mpsc::Sender<WsCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回，启动时已经对账过
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            let report = match self.reconcile().await {
                Ok(report) => report,
                Err(e) => {
                    handle_error(&e, "周期对账");
                    continue;
                }
            };

            let change = match apply_to_engine(&cmd_tx, &report).await {
                Some(change) => change,
                None => {
                    warn!(target: SYMBOL_MANAGER_TARGET, "计算核心已退出，停止周期对账");
                    break;
                }
            };

            if !change.activated.is_empty()
                && ws_cmd_tx.send(WsCommand::Subscribe(change.activated)).await.is_err()
            {
                warn!(target: SYMBOL_MANAGER_TARGET, "I/O核心已退出，无法发送订阅");
            }
            if !change.delisted.is_empty()
                && ws_cmd_tx.send(WsCommand::Unsubscribe(change.delisted)).await.is_err()
            {
                warn!(target: SYMBOL_MANAGER_TARGET, "I/O核心已退出，无法发送退订");
            }
        }

        info!(target: SYMBOL_MANAGER_TARGET, log_type = "low_freq", "周期对账已停止");
    }
}

/// 把对账结果发给计算核心并等待确认
pub async fn apply_to_engine(cmd_tx: &mpsc::Sender<EngineCmd>, report: &ReconcileReport) -> Option<MembershipChange> {
    let (ack_tx, ack_rx) = oneshot::channel();
    let cmd = EngineCmd::ApplyMembership {
        eligible: report.eligible(),
        removed: report.removed.iter().cloned().collect(),
        ack: ack_tx,
    };
    cmd_tx.send(cmd).await.ok()?;
    ack_rx.await.ok()
}
