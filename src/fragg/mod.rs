//! 资金费率聚合引擎
//!
//! 单一计算循环拥有全部品种状态（tick 缓冲区与5分钟待聚合队列），无需加锁：
//! - I/O 任务（`StreamConsumer`）把每条入站消息解码成一个 `TickBatch` 发过来
//! - 品种管理器通过 `EngineCmd` 调整可处理的品种集合
//! - 每个 `TickBatch` 作为一个原子单元按到达顺序处理，同一品种的 tick 严格按序折叠

pub mod persistence;
pub mod rollup;
pub mod stream_consumer;
pub mod symbol_registry;
pub mod tick_buffer;


pub use persistence::PersistenceClient;
pub use rollup::{fold_records, PendingFiveMinute, WindowFold};
pub use stream_consumer::{ConsumerState, StreamConsumer};
pub use symbol_registry::{ReconcileReport, SymbolRegistry};
pub use tick_buffer::{fold_minute, round_funding_mean, TickBuffer};

use crate::frcommon::boundary::{now_secs, BoundaryCrossing};
use crate::frcommon::config::AggregationConfig;
use crate::frcommon::models::{BucketRecord, Interval, SymbolStatus, TickBatch};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

/// 计算核心日志目标
pub const COMPUTE_TARGET: &str = "计算核心";

/// 发往计算核心的命令
#[derive(Debug)]
pub enum EngineCmd {
    /// 应用一次对账结果：`eligible` 为可处理品种，`removed` 为已下架品种
    ApplyMembership {
        eligible: Vec<String>,
        removed: Vec<String>,
        ack: oneshot::Sender<MembershipChange>,
    },
}

/// 一次品种集合调整的实际效果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub activated: Vec<String>,
    pub delisted: Vec<String>,
}

/// 计算核心运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub messages: u64,
    pub ticks_routed: u64,
    pub ticks_unknown: u64,
    pub ticks_inactive: u64,
    pub malformed_elements: u64,
    pub minute_buckets: u64,
    pub five_minute_buckets: u64,
    pub hourly_buckets: u64,
    pub daily_buckets: u64,
}

#[derive(Debug)]
struct SymbolSlot {
    status: SymbolStatus,
    ticks: TickBuffer,
    pending_5m: PendingFiveMinute,
}

/// 一条消息内观察到的整点/零点边界
#[derive(Debug, Default, Clone, Copy)]
struct CoarseCrossings {
    hour: Option<i64>,
    day: Option<i64>,
}

pub struct AggregationEngine {
    slots: HashMap<String, SymbolSlot>,
    persistence: PersistenceClient,
    flush_threshold: usize,
    hourly: WindowFold,
    daily: WindowFold,
    /// 最近一次观察到的整点时间，用于小时/日桶时间回退
    last_hourly_ts: Option<i64>,
    last_hour_fold: Option<i64>,
    last_day_fold: Option<i64>,
    warned_unknown: HashSet<String>,
    stats: EngineStats,
    stats_interval: Duration,
    /// 上次统计时的 (未知品种, 已下架品种) tick 数
    last_dropped: (u64, u64),
}

impl AggregationEngine {
    pub fn new(persistence: PersistenceClient, config: &AggregationConfig) -> Self {
        Self {
            slots: HashMap::new(),
            persistence,
            flush_threshold: config.flush_tick_threshold,
            hourly: WindowFold::hourly(config.hourly_window),
            daily: WindowFold::daily(config.daily_window),
            last_hourly_ts: None,
            last_hour_fold: None,
            last_day_fold: None,
            warned_unknown: HashSet::new(),
            stats: EngineStats::default(),
            stats_interval: Duration::from_secs(config.stats_interval_secs.max(1)),
            last_dropped: (0, 0),
        }
    }

    /// 应用品种集合：新品种建槽并激活，下架品种停止处理（已缓冲数据丢弃，存储保留）
    pub fn apply_membership(&mut self, eligible: &[String], removed: &[String]) -> MembershipChange {
        let mut change = MembershipChange::default();

        for symbol in eligible {
            match self.slots.get_mut(symbol) {
                Some(slot) if slot.status == SymbolStatus::Active => {}
                Some(slot) => {
                    slot.status = SymbolStatus::Active;
                    change.activated.push(symbol.clone());
                }
                None => {
                    self.slots.insert(
                        symbol.clone(),
                        SymbolSlot {
                            status: SymbolStatus::Active,
                            ticks: TickBuffer::new(self.flush_threshold),
                            pending_5m: PendingFiveMinute::default(),
                        },
                    );
                    self.warned_unknown.remove(symbol);
                    change.activated.push(symbol.clone());
                }
            }
        }

        for symbol in removed {
            if let Some(slot) = self.slots.get_mut(symbol) {
                if slot.status == SymbolStatus::Active {
                    slot.status = SymbolStatus::Delisted;
                    slot.ticks = TickBuffer::new(self.flush_threshold);
                    slot.pending_5m = PendingFiveMinute::default();
                    change.delisted.push(symbol.clone());
                }
            }
        }

        if !change.activated.is_empty() || !change.delisted.is_empty() {
            info!(
                target: COMPUTE_TARGET,
                log_type = "low_freq",
                activated = change.activated.len(),
                delisted = change.delisted.len(),
                active_total = self.active_symbols().len(),
                "品种集合已更新"
            );
        }
        change
    }

    /// 当前可处理的品种，按名称排序
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.status == SymbolStatus::Active)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn status(&self, symbol: &str) -> Option<SymbolStatus> {
        self.slots.get(symbol).map(|slot| slot.status)
    }

    pub fn buffered_ticks(&self, symbol: &str) -> usize {
        self.slots.get(symbol).map_or(0, |slot| slot.ticks.len())
    }

    pub fn pending_five_minute(&self, symbol: &str) -> usize {
        self.slots.get(symbol).map_or(0, |slot| slot.pending_5m.len())
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// 处理一条入站消息
    pub async fn process_batch(&mut self, batch: TickBatch) {
        self.stats.messages += 1;
        self.stats.malformed_elements += batch.malformed as u64;
        if batch.malformed > 0 {
            debug!(target: COMPUTE_TARGET, malformed = batch.malformed, "消息中有元素解码失败，已丢弃");
        }

        let mut crossings = CoarseCrossings::default();

        for tick in batch.ticks {
            let flushed = match self.slots.get_mut(&tick.symbol) {
                Some(slot) if slot.status == SymbolStatus::Active => {
                    let symbol = tick.symbol.clone();
                    slot.ticks.push(tick);
                    self.stats.ticks_routed += 1;
                    if slot.ticks.should_flush() {
                        slot.ticks.flush().map(|flush| (symbol, flush))
                    } else {
                        None
                    }
                }
                Some(_) => {
                    self.stats.ticks_inactive += 1;
                    trace!(target: COMPUTE_TARGET, symbol = %tick.symbol, "已下架品种的 tick，丢弃");
                    None
                }
                None => {
                    self.stats.ticks_unknown += 1;
                    if self.warned_unknown.insert(tick.symbol.clone()) {
                        warn!(target: COMPUTE_TARGET, symbol = %tick.symbol, "未知品种的 tick，丢弃");
                    } else {
                        trace!(target: COMPUTE_TARGET, symbol = %tick.symbol, "未知品种的 tick，丢弃");
                    }
                    None
                }
            };

            if let Some((symbol, (record, boundary))) = flushed {
                self.on_minute_bucket(&symbol, record, boundary, &mut crossings).await;
            }
        }

        if let Some(hour) = crossings.hour {
            if self.last_hour_fold != Some(hour) {
                self.last_hour_fold = Some(hour);
                self.fold_window_all(self.hourly, hour).await;
            }
        }
        if let Some(day) = crossings.day {
            if self.last_day_fold != Some(day) {
                self.last_day_fold = Some(day);
                self.fold_window_all(self.daily, day).await;
            }
        }
    }

    /// 1分钟桶：写入，进入5分钟队列，遇5分钟边界折叠写入
    async fn on_minute_bucket(
        &mut self,
        symbol: &str,
        record: BucketRecord,
        boundary: BoundaryCrossing,
        crossings: &mut CoarseCrossings,
    ) {
        self.persistence
            .upsert_bucket(Interval::OneMinute, symbol, &record)
            .await;
        self.stats.minute_buckets += 1;

        let five_minute = match self.slots.get_mut(symbol) {
            Some(slot) => {
                slot.pending_5m.push(record);
                if boundary.crosses(Interval::FiveMinutes) {
                    slot.pending_5m.fold()
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(record) = five_minute {
            self.persistence
                .upsert_bucket(Interval::FiveMinutes, symbol, &record)
                .await;
            self.stats.five_minute_buckets += 1;
        }

        if boundary.crosses(Interval::OneHour) {
            self.last_hourly_ts = Some(boundary.aligned);
            crossings.hour = Some(boundary.aligned);
        }
        if boundary.crosses(Interval::OneDay) {
            crossings.day = Some(boundary.aligned);
        }
    }

    /// 对所有可处理品种执行一次小时或日聚合
    #[instrument(target = "计算核心", skip(self, fold), fields(target_interval = %fold.target))]
    async fn fold_window_all(&mut self, fold: WindowFold, boundary_ts: i64) {
        let now = now_secs();
        let mut written = 0usize;
        let mut skipped = 0usize;

        for symbol in self.active_symbols() {
            let rows = match self
                .persistence
                .fetch_last_rows(fold.source, &symbol, fold.window)
                .await
            {
                Some(rows) => rows,
                None => {
                    skipped += 1;
                    continue;
                }
            };

            match fold.fold(&rows, self.last_hourly_ts, now) {
                Some(record) => {
                    self.persistence.upsert_bucket(fold.target, &symbol, &record).await;
                    written += 1;
                }
                None => {
                    skipped += 1;
                    debug!(
                        target: COMPUTE_TARGET,
                        %symbol,
                        rows = rows.len(),
                        window = fold.window,
                        "历史行数不足，本轮跳过"
                    );
                }
            }
        }

        match fold.target {
            Interval::OneDay => self.stats.daily_buckets += written as u64,
            _ => self.stats.hourly_buckets += written as u64,
        }

        info!(
            target: COMPUTE_TARGET,
            log_type = "low_freq",
            interval = %fold.target,
            boundary_ts,
            written,
            skipped,
            "周期汇总完成"
        );
    }

    fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::ApplyMembership { eligible, removed, ack } => {
                let change = self.apply_membership(&eligible, &removed);
                if ack.send(change).is_err() {
                    warn!(target: COMPUTE_TARGET, "品种管理器已不再等待确认");
                }
            }
        }
    }

    fn log_stats(&mut self) {
        let (written, dropped) = self.persistence.write_counters();
        info!(
            target: COMPUTE_TARGET,
            log_type = "low_freq",
            messages = self.stats.messages,
            ticks_routed = self.stats.ticks_routed,
            ticks_unknown = self.stats.ticks_unknown,
            ticks_inactive = self.stats.ticks_inactive,
            malformed = self.stats.malformed_elements,
            minute_buckets = self.stats.minute_buckets,
            five_minute_buckets = self.stats.five_minute_buckets,
            hourly_buckets = self.stats.hourly_buckets,
            daily_buckets = self.stats.daily_buckets,
            writes_ok = written,
            writes_dropped = dropped,
            "📊 计算核心统计"
        );

        // 未知品种首次之后的丢弃按周期汇总告警
        let (unknown, inactive) = self.take_dropped_delta();
        if unknown > 0 || inactive > 0 {
            warn!(
                target: COMPUTE_TARGET,
                unknown,
                inactive,
                "本周期丢弃了未知或已下架品种的 tick"
            );
        }
    }

    /// 自上次调用以来丢弃的 (未知品种, 已下架品种) tick 数
    fn take_dropped_delta(&mut self) -> (u64, u64) {
        let delta = (
            self.stats.ticks_unknown - self.last_dropped.0,
            self.stats.ticks_inactive - self.last_dropped.1,
        );
        self.last_dropped = (self.stats.ticks_unknown, self.stats.ticks_inactive);
        delta
    }

    /// 计算核心主循环
    ///
    /// 批次通道关闭（I/O 任务终止并释放发送端）后退出，此前已入队的消息全部处理完毕。
    #[instrument(target = "计算核心", skip_all, name = "run_aggregation_loop")]
    pub async fn run_aggregation_loop(
        mut self,
        mut batch_rx: mpsc::Receiver<TickBatch>,
        mut cmd_rx: mpsc::Receiver<EngineCmd>,
    ) -> EngineStats {
        info!(target: COMPUTE_TARGET, log_type = "low_freq", "计算核心循环启动");
        let mut stats_interval = tokio::time::interval(self.stats_interval);
        stats_interval.tick().await;
        let mut cmd_open = true;

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv(), if cmd_open => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => cmd_open = false,
                },

                batch = batch_rx.recv() => match batch {
                    Some(batch) => self.process_batch(batch).await,
                    None => break,
                },

                _ = stats_interval.tick() => self.log_stats(),
            }
        }

        self.log_stats();
        info!(target: COMPUTE_TARGET, log_type = "low_freq", "批次通道已关闭，计算核心退出");
        self.stats
    }
}
