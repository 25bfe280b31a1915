//! 每品种的 tick 缓冲区与1分钟聚合

use crate::frcommon::boundary::{detect_boundary, format_datetime, BoundaryCrossing};
use crate::frcommon::models::{BucketRecord, Tick};

/// 资金费率均值保留16位小数
pub fn round_funding_mean(v: f64) -> f64 {
    (v * 1e16).round() / 1e16
}

pub(crate) fn mean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0_f64, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// 把一组 tick 折叠成一条1分钟记录，同时返回最后一个 tick 的边界检测结果
pub fn fold_minute(ticks: &[Tick]) -> Option<(BucketRecord, BoundaryCrossing)> {
    let last = ticks.last()?;
    let boundary = detect_boundary(last.event_time);

    let record = BucketRecord {
        timestamp: boundary.aligned,
        datetime: format_datetime(boundary.aligned),
        funding_rate: last.funding_rate,
        funding_rate_mean: round_funding_mean(mean(ticks.iter().map(|t| t.funding_rate))),
        mark_price_mean: mean(ticks.iter().map(|t| t.mark_price)),
        index_price_mean: mean(ticks.iter().map(|t| t.index_price)),
        oi_transaction_timestamp: None,
        oi_transaction_datetime: None,
        open_interest: None,
    };
    Some((record, boundary))
}

/// 单个品种自上次 flush 以来按到达顺序累积的 tick
#[derive(Debug)]
pub struct TickBuffer {
    ticks: Vec<Tick>,
    threshold: usize,
}

impl TickBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            ticks: Vec::with_capacity(threshold),
            threshold,
        }
    }

    pub fn push(&mut self, tick: Tick) {
        self.ticks.push(tick);
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// 只看本品种自己的缓冲区：数量达到阈值，或最新 tick 恰好落在整分钟
    pub fn should_flush(&self) -> bool {
        match self.ticks.last() {
            Some(last) => self.ticks.len() >= self.threshold || last.event_time.rem_euclid(60) == 0,
            None => false,
        }
    }

    /// 折叠并清空缓冲区
    pub fn flush(&mut self) -> Option<(BucketRecord, BoundaryCrossing)> {
        let ticks = std::mem::replace(&mut self.ticks, Vec::with_capacity(self.threshold));
        fold_minute(&ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frcommon::models::Interval;

    fn tick(event_time: i64, funding_rate: f64) -> Tick {
        Tick {
            symbol: "BTCUSDT".to_string(),
            event_time,
            transaction_time: event_time,
            funding_rate,
            mark_price: 100.0 + funding_rate * 1e4,
            index_price: 99.0,
        }
    }

    #[test]
    fn test_flush_on_threshold() {
        let mut buffer = TickBuffer::new(3);
        buffer.push(tick(1_700_000_041, 0.0001));
        buffer.push(tick(1_700_000_042, 0.0002));
        assert!(!buffer.should_flush());
        buffer.push(tick(1_700_000_043, 0.0003));
        assert!(buffer.should_flush());

        let (record, boundary) = buffer.flush().unwrap();
        assert!(buffer.is_empty(), "flush 后缓冲区必须清空");
        assert_eq!(record.timestamp, 1_700_000_040);
        assert_eq!(boundary.aligned, 1_700_000_040);
        assert_eq!(record.funding_rate, 0.0003);
        assert_eq!(record.funding_rate_mean, round_funding_mean((0.0001 + 0.0002 + 0.0003) / 3.0));
        assert_eq!(record.index_price_mean, 99.0);
    }

    #[test]
    fn test_flush_on_minute_tick() {
        let mut buffer = TickBuffer::new(20);
        buffer.push(tick(1_700_000_059, 0.0001));
        assert!(!buffer.should_flush());
        buffer.push(tick(1_700_000_100, 0.0001));
        assert!(buffer.should_flush());
        let (_, boundary) = buffer.flush().unwrap();
        assert!(boundary.crosses(Interval::FiveMinutes));
    }

    #[test]
    fn test_second_flush_does_not_reprocess() {
        let mut buffer = TickBuffer::new(2);
        buffer.push(tick(1_700_000_041, 0.0001));
        buffer.push(tick(1_700_000_042, 0.0001));
        let (first, _) = buffer.flush().unwrap();

        buffer.push(tick(1_700_000_101, 0.0009));
        buffer.push(tick(1_700_000_102, 0.0009));
        let (second, _) = buffer.flush().unwrap();
        assert_eq!(first.funding_rate_mean, 0.0001);
        assert_eq!(second.funding_rate_mean, 0.0009);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_round_funding_mean() {
        assert_eq!(round_funding_mean(0.000_123_456_789_012_345_678), 0.000_123_456_789_012_3);
        assert_eq!(mean(Vec::<f64>::new()), 0.0);
    }
}
