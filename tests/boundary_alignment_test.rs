use funding_rate_server::frcommon::models::Interval;
use funding_rate_server::frcommon::{detect_boundary, format_datetime, is_aligned};

/// 边界检测的对齐性质测试
#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14 00:00:00 UTC
    const MIDNIGHT: i64 = 1_699_920_000;

    #[test]
    fn test_aligned_to_nearest_minute() {
        // 一整天内逐秒检查：结果总是整分钟，且与原时间相差不超过30秒
        for t in MIDNIGHT..MIDNIGHT + 86_400 {
            let aligned = detect_boundary(t).aligned;
            assert_eq!(aligned % 60, 0, "t={}", t);
            assert!((aligned - t).abs() <= 30, "t={} aligned={}", t, aligned);
        }
    }

    #[test]
    fn test_monotonic_in_event_time() {
        let mut previous = detect_boundary(MIDNIGHT - 1).aligned;
        for t in MIDNIGHT..MIDNIGHT + 7_200 {
            let aligned = detect_boundary(t).aligned;
            assert!(aligned >= previous, "t={}", t);
            previous = aligned;
        }
    }

    #[test]
    fn test_crossings_match_alignment() {
        for t in (MIDNIGHT - 3_600..MIDNIGHT + 3_600).step_by(7) {
            let crossing = detect_boundary(t);
            assert!(crossing.crosses(Interval::OneMinute));
            for interval in [Interval::FiveMinutes, Interval::OneHour, Interval::OneDay] {
                assert_eq!(
                    crossing.crosses(interval),
                    is_aligned(crossing.aligned, interval),
                    "t={} interval={}",
                    t,
                    interval
                );
            }
        }
    }

    #[test]
    fn test_rounding_around_midnight() {
        // 23:59:30 进位到零点，跨越所有周期
        let crossing = detect_boundary(MIDNIGHT - 30);
        assert_eq!(crossing.aligned, MIDNIGHT);
        assert_eq!(crossing.crossed(), Interval::ALL.to_vec());
        assert_eq!(format_datetime(crossing.aligned), "2023-11-14 00:00:00");

        // 23:59:29 舍到 23:59:00，只跨越1分钟
        let crossing = detect_boundary(MIDNIGHT - 31);
        assert_eq!(crossing.aligned, MIDNIGHT - 60);
        assert_eq!(crossing.crossed(), vec![Interval::OneMinute]);
        assert_eq!(format_datetime(crossing.aligned), "2023-11-13 23:59:00");
    }
}
