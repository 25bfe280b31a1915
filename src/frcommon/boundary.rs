//! 时间边界检测
//!
//! 把原始秒级时间戳四舍五入到整分钟，并判断这个整分钟跨越了哪些更粗的周期。
//! 跨越判断只作用于取整后的值：取整本身就可能把时间推过边界。

use crate::frcommon::models::Interval;
use chrono::{TimeZone, Utc};

/// 边界检测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryCrossing {
    /// 对齐后的整分钟时间戳
    pub aligned: i64,
    crossed: u8,
}

impl BoundaryCrossing {
    pub fn crosses(&self, interval: Interval) -> bool {
        self.crossed & interval.bit() != 0
    }

    /// 按从细到粗的顺序列出跨越的周期
    pub fn crossed(&self) -> Vec<Interval> {
        Interval::ALL
            .iter()
            .copied()
            .filter(|i| self.crosses(*i))
            .collect()
    }
}

/// s = t mod 60；s >= 30 向上取整，否则向下取整。1m 总是跨越。
pub fn detect_boundary(t: i64) -> BoundaryCrossing {
    let s = t.rem_euclid(60);
    let aligned = if s >= 30 { t + (60 - s) } else { t - s };

    let crossed = Interval::ALL
        .iter()
        .filter(|i| is_aligned(aligned, **i))
        .fold(0u8, |acc, i| acc | i.bit());

    BoundaryCrossing { aligned, crossed }
}

pub fn is_aligned(ts: i64, interval: Interval) -> bool {
    ts.rem_euclid(interval.seconds()) == 0
}

/// 当前墙钟时间（秒）
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// 毫秒转秒，整除截断
pub fn millis_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

/// `datetime` 列的文本格式，UTC
pub fn format_datetime(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_rule() {
        // 1_700_000_040 是整分钟
        assert_eq!(detect_boundary(1_700_000_040).aligned, 1_700_000_040);
        assert_eq!(detect_boundary(1_700_000_069).aligned, 1_700_000_040);
        assert_eq!(detect_boundary(1_700_000_070).aligned, 1_700_000_100);
        assert_eq!(detect_boundary(1_700_000_099).aligned, 1_700_000_100);
    }

    #[test]
    fn test_rounding_pushes_across_boundary() {
        // 原始时间不在5分钟边界上，取整后落在边界上
        let b = detect_boundary(1_700_000_095);
        assert_eq!(b.aligned, 1_700_000_100);
        assert!(b.crosses(Interval::FiveMinutes));
        assert!(!b.crosses(Interval::OneHour));
    }

    #[test]
    fn test_one_minute_always_crossed() {
        for t in [0_i64, 29, 30, 59, 1_700_000_001, 1_700_000_059] {
            assert!(detect_boundary(t).crosses(Interval::OneMinute), "t={}", t);
        }
    }

    #[test]
    fn test_day_boundary_crosses_everything() {
        let b = detect_boundary(1_699_920_000 - 10);
        assert_eq!(b.aligned, 1_699_920_000);
        assert_eq!(b.crossed(), Interval::ALL.to_vec());
    }

    #[test]
    fn test_format_datetime_utc() {
        assert_eq!(format_datetime(1_699_920_000), "2023-11-14 00:00:00");
        assert_eq!(millis_to_secs(1_699_920_000_999), 1_699_920_000);
    }
}
