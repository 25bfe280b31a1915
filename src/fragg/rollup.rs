//! 周期汇总：5分钟待聚合队列，以及基于已持久化数据的小时/日聚合

use super::tick_buffer::{mean, round_funding_mean};
use crate::frcommon::boundary::{detect_boundary, format_datetime, is_aligned};
use crate::frcommon::models::{BucketRecord, Interval};

/// 按时间正序的一组记录折叠为一条：取最后一条的资金费率与时间，其余字段取均值
pub fn fold_records(records: &[BucketRecord]) -> Option<BucketRecord> {
    let last = records.last()?;
    Some(BucketRecord {
        timestamp: last.timestamp,
        datetime: last.datetime.clone(),
        funding_rate: last.funding_rate,
        funding_rate_mean: round_funding_mean(mean(records.iter().map(|r| r.funding_rate_mean))),
        mark_price_mean: mean(records.iter().map(|r| r.mark_price_mean)),
        index_price_mean: mean(records.iter().map(|r| r.index_price_mean)),
        oi_transaction_timestamp: None,
        oi_transaction_datetime: None,
        open_interest: None,
    })
}

/// 单个品种自上次5分钟聚合以来的1分钟记录
#[derive(Debug, Default)]
pub struct PendingFiveMinute {
    records: Vec<BucketRecord>,
}

impl PendingFiveMinute {
    pub fn push(&mut self, record: BucketRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 折叠全部待聚合记录并清空队列
    pub fn fold(&mut self) -> Option<BucketRecord> {
        let records = std::mem::take(&mut self.records);
        fold_records(&records)
    }
}

/// 小时/日聚合的参数
#[derive(Debug, Clone, Copy)]
pub struct WindowFold {
    /// 目标周期
    pub target: Interval,
    /// 读取来源周期
    pub source: Interval,
    /// 读取行数
    pub window: usize,
}

impl WindowFold {
    pub fn hourly(window: usize) -> Self {
        Self {
            target: Interval::OneHour,
            source: Interval::FiveMinutes,
            window,
        }
    }

    pub fn daily(window: usize) -> Self {
        Self {
            target: Interval::OneDay,
            source: Interval::OneHour,
            window,
        }
    }

    /// 桶时间：最近一行已对齐则直接使用；否则用记住的整点时间（若对齐）；
    /// 再否则用当前墙钟时间按分钟取整
    pub fn resolve_timestamp(&self, rows: &[BucketRecord], last_hourly: Option<i64>, now: i64) -> i64 {
        if let Some(first) = rows.first() {
            if is_aligned(first.timestamp, self.target) {
                return first.timestamp;
            }
        }
        match last_hourly {
            Some(ts) if is_aligned(ts, self.target) => ts,
            _ => detect_boundary(now).aligned,
        }
    }

    /// `rows` 为最近优先的已持久化行；行数不足窗口时跳过，不产生残缺记录
    pub fn fold(&self, rows: &[BucketRecord], last_hourly: Option<i64>, now: i64) -> Option<BucketRecord> {
        if rows.is_empty() || rows.len() < self.window {
            return None;
        }
        let rows = &rows[..self.window];
        let timestamp = self.resolve_timestamp(rows, last_hourly, now);

        Some(BucketRecord {
            timestamp,
            datetime: format_datetime(timestamp),
            funding_rate: rows[0].funding_rate,
            funding_rate_mean: round_funding_mean(mean(rows.iter().map(|r| r.funding_rate_mean))),
            mark_price_mean: mean(rows.iter().map(|r| r.mark_price_mean)),
            index_price_mean: mean(rows.iter().map(|r| r.index_price_mean)),
            oi_transaction_timestamp: None,
            oi_transaction_datetime: None,
            open_interest: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: i64, funding_rate: f64, mark: f64) -> BucketRecord {
        BucketRecord {
            timestamp,
            datetime: format_datetime(timestamp),
            funding_rate,
            funding_rate_mean: funding_rate,
            mark_price_mean: mark,
            index_price_mean: mark - 1.0,
            oi_transaction_timestamp: None,
            oi_transaction_datetime: None,
            open_interest: None,
        }
    }

    // 1_699_999_200 是整点
    const HOUR: i64 = 1_699_999_200;

    #[test]
    fn test_five_minute_fold_takes_last_and_clears() {
        let mut pending = PendingFiveMinute::default();
        for (i, rate) in [0.0001, 0.0002, 0.0003, 0.0004, 0.0005].iter().enumerate() {
            pending.push(record(HOUR + 60 * (i as i64 + 1), *rate, 10.0 + i as f64));
        }
        let folded = pending.fold().unwrap();
        assert!(pending.is_empty());
        assert_eq!(folded.timestamp, HOUR + 300);
        assert_eq!(folded.funding_rate, 0.0005);
        assert_eq!(folded.mark_price_mean, 12.0);
        assert!((folded.funding_rate_mean - 0.0003).abs() < 1e-15);
        assert!(pending.fold().is_none());
    }

    #[test]
    fn test_hourly_fold_skips_short_window() {
        let fold = WindowFold::hourly(12);
        let rows: Vec<_> = (0..11).map(|i| record(HOUR - 300 * i, 0.0001, 10.0)).collect();
        assert!(fold.fold(&rows, None, HOUR).is_none());
        assert!(fold.fold(&[], None, HOUR).is_none());
    }

    #[test]
    fn test_hourly_fold_uses_aligned_latest_row() {
        let fold = WindowFold::hourly(12);
        let rows: Vec<_> = (0..12)
            .map(|i| record(HOUR - 300 * i, 0.0001 * (12 - i) as f64, 10.0))
            .collect();
        let folded = fold.fold(&rows, None, HOUR + 7).unwrap();
        assert_eq!(folded.timestamp, HOUR);
        // 最近一行的资金费率
        assert_eq!(folded.funding_rate, rows[0].funding_rate);
        assert_eq!(folded.mark_price_mean, 10.0);
    }

    #[test]
    fn test_timestamp_fallbacks() {
        let fold = WindowFold::hourly(1);
        let jittered = [record(HOUR - 60, 0.0001, 10.0)];
        // 记住的整点时间已对齐
        assert_eq!(fold.resolve_timestamp(&jittered, Some(HOUR), HOUR + 3), HOUR);
        // 记住的时间未对齐，退回到墙钟时间取整
        assert_eq!(fold.resolve_timestamp(&jittered, Some(HOUR + 60), HOUR + 40), HOUR + 60);
        assert_eq!(fold.resolve_timestamp(&jittered, None, HOUR + 10), HOUR);

        // 日聚合：整点不是零点时不使用
        let daily = WindowFold::daily(1);
        let midnight = 1_699_920_000;
        assert_eq!(daily.resolve_timestamp(&jittered, Some(HOUR), midnight + 5), midnight);
        assert_eq!(daily.resolve_timestamp(&[record(midnight, 0.0, 1.0)], None, HOUR), midnight);
    }
}
