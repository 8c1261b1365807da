use chrono::{NaiveTime, Timelike};

use crate::registry::TimeIntervalRecord;

/// Daily arming window at minute resolution, inclusive on both ends.
/// A window whose start is after its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    /// 00:00 through 23:59.
    pub fn always() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn from_record(record: &TimeIntervalRecord) -> Self {
        Self::parse(&record.start_time, &record.end_time).unwrap_or_else(|| {
            tracing::warn!(
                start = %record.start_time,
                end = %record.end_time,
                "malformed time window, using full day"
            );
            Self::always()
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        let t = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::always()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let w = TimeWindow::parse("08:00", "18:00").unwrap();
        assert!(w.contains(at(8, 0, 0)));
        assert!(w.contains(at(12, 30, 0)));
        assert!(w.contains(at(18, 0, 59)));
        assert!(!w.contains(at(18, 1, 0)));
        assert!(!w.contains(at(7, 59, 59)));
    }

    #[test]
    fn test_overnight_window_wraps() {
        let w = TimeWindow::parse("22:00", "06:00").unwrap();
        assert!(w.contains(at(23, 0, 0)));
        assert!(w.contains(at(2, 0, 0)));
        assert!(w.contains(at(6, 0, 0)));
        assert!(!w.contains(at(12, 0, 0)));
    }

    #[test]
    fn test_always_and_fallback() {
        let w = TimeWindow::always();
        assert!(w.contains(at(0, 0, 0)));
        assert!(w.contains(at(23, 59, 59)));
        assert!(TimeWindow::parse("25:00", "06:00").is_none());
        let record = TimeIntervalRecord {
            start_time: "bogus".into(),
            end_time: "06:00".into(),
        };
        assert_eq!(TimeWindow::from_record(&record), TimeWindow::always());
    }
}
