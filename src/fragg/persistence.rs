//! 持久化客户端
//!
//! 网关调用是阻塞 I/O：放到 `spawn_blocking` 上执行并套上超时。
//! 单次读写失败或超时按 `PersistenceWriteError` 处置：记录日志，丢弃这一桶，不重试。

use crate::frcommon::db::{PersistenceGateway, SymbolDiff, PERSISTENCE_TARGET};
use crate::frcommon::models::{BucketRecord, CoinListing, Interval};
use crate::frcommon::{handle_error, AppError, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, Span};

#[derive(Clone)]
pub struct PersistenceClient {
    gateway: Arc<dyn PersistenceGateway>,
    timeout: Duration,
    written: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl PersistenceClient {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, timeout: Duration) -> Self {
        Self {
            gateway,
            timeout,
            written: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 在阻塞线程池上执行一次网关调用，超时或任务异常都转为 `PersistenceWriteError`
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PersistenceGateway) -> Result<T> + Send + 'static,
    {
        let gateway = self.gateway.clone();
        let parent_span = Span::current();
        let handle = tokio::task::spawn_blocking(move || parent_span.in_scope(|| f(gateway.as_ref())));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::PersistenceWriteError(format!(
                "{} 任务异常: {}",
                op, join_err
            ))),
            Err(_) => Err(AppError::PersistenceWriteError(format!(
                "{} 超时 ({:?})",
                op, self.timeout
            ))),
        }
    }

    pub async fn fetch_symbol_list(&self) -> Result<Vec<CoinListing>> {
        self.call("fetch_symbol_list", |g| g.fetch_symbol_list()).await
    }

    pub async fn existing_symbols(&self) -> Result<BTreeSet<String>> {
        self.call("existing_symbols", |g| g.existing_symbols()).await
    }

    pub async fn diff_symbols(&self) -> Result<SymbolDiff> {
        self.call("diff_symbols", |g| g.diff_symbols()).await
    }

    pub async fn provision_symbol(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.to_string();
        self.call("provision_symbol", move |g| g.provision_symbol(&symbol))
            .await
            .map_err(|e| match e {
                AppError::SchemaProvisionError(_) => e,
                other => AppError::SchemaProvisionError(other.to_string()),
            })
    }

    /// 写入一条桶记录；失败只记录日志并丢弃，返回 None
    pub async fn upsert_bucket(&self, interval: Interval, symbol: &str, record: &BucketRecord) -> Option<usize> {
        let table = interval.table_name(symbol);
        let (columns, values) = record.to_row();
        let timestamp = record.timestamp;

        let result = self
            .call("upsert_row", move |g| g.upsert_row(&table, &columns, &values))
            .await;

        match result {
            Ok(affected) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                trace!(target: PERSISTENCE_TARGET, %symbol, %interval, timestamp, affected, "桶记录已写入");
                Some(affected)
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                handle_error(&e, &format!("写入 {} {} @{}", symbol, interval, timestamp));
                None
            }
        }
    }

    /// 读取最近 n 行；失败只记录日志，返回 None
    pub async fn fetch_last_rows(&self, interval: Interval, symbol: &str, n: usize) -> Option<Vec<BucketRecord>> {
        let table = interval.table_name(symbol);
        match self.call("fetch_last_rows", move |g| g.fetch_last_rows(&table, n)).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                handle_error(&e, &format!("读取 {} {}", symbol, interval));
                None
            }
        }
    }

    /// (已写入, 已丢弃)
    pub fn write_counters(&self) -> (u64, u64) {
        (
            self.written.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}
