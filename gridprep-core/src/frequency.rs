//! Calendar frequency units and step arithmetic.
//!
//! The pipeline inherits its time resolution from the source dataset and must
//! be able to step dates backwards and forwards by whole units of that
//! resolution. Month and year steps clamp the day-of-month, so stepping a
//! month forward from Jan 31 lands on the last day of February.

use chrono::{Duration, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// The time coordinate used throughout the pipeline.
pub type TimeStamp = NaiveDateTime;

/// Time resolution of a source dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Hour,
    Day,
    Month,
    Year,
}

impl Frequency {
    /// Unit name used in log messages and manifests.
    pub fn unit_name(&self) -> &'static str {
        match self {
            Frequency::Hour => "hour",
            Frequency::Day => "day",
            Frequency::Month => "month",
            Frequency::Year => "year",
        }
    }

    /// Step `t` by a signed number of whole units.
    pub fn offset(&self, t: TimeStamp, steps: i64) -> TimeStamp {
        match self {
            Frequency::Hour => t + Duration::hours(steps),
            Frequency::Day => t + Duration::days(steps),
            Frequency::Month => Self::offset_months(t, steps),
            Frequency::Year => Self::offset_months(t, steps * 12),
        }
    }

    fn offset_months(t: TimeStamp, months: i64) -> TimeStamp {
        let n = Months::new(months.unsigned_abs() as u32);
        let stepped = if months >= 0 {
            t.checked_add_months(n)
        } else {
            t.checked_sub_months(n)
        };
        stepped.expect("date arithmetic out of representable range")
    }

    /// Frequency-appropriate label for `t`, used in file naming.
    pub fn label(&self, t: TimeStamp) -> String {
        let fmt = match self {
            Frequency::Hour => "%Y-%m-%dT%H",
            Frequency::Day => "%Y-%m-%d",
            Frequency::Month => "%Y-%m",
            Frequency::Year => "%Y",
        };
        t.format(fmt).to_string()
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.unit_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> TimeStamp {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn day_offsets() {
        assert_eq!(Frequency::Day.offset(ts(2000, 1, 2), -1), ts(2000, 1, 1));
        assert_eq!(Frequency::Day.offset(ts(2000, 2, 28), 1), ts(2000, 2, 29));
        assert_eq!(Frequency::Day.offset(ts(2001, 2, 28), 1), ts(2001, 3, 1));
    }

    #[test]
    fn month_offset_clamps_day() {
        assert_eq!(Frequency::Month.offset(ts(2000, 1, 31), 1), ts(2000, 2, 29));
        assert_eq!(Frequency::Month.offset(ts(2001, 3, 31), -1), ts(2001, 2, 28));
    }

    #[test]
    fn year_offset_clamps_leap_day() {
        assert_eq!(Frequency::Year.offset(ts(2000, 2, 29), 1), ts(2001, 2, 28));
    }

    #[test]
    fn hour_offsets() {
        let t = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(23, 0, 0)
            .unwrap();
        let expected = NaiveDate::from_ymd_opt(2000, 1, 2)
            .unwrap()
            .and_hms_opt(1, 0, 0)
            .unwrap();
        assert_eq!(Frequency::Hour.offset(t, 2), expected);
    }

    #[test]
    fn labels() {
        assert_eq!(Frequency::Day.label(ts(2000, 1, 2)), "2000-01-02");
        assert_eq!(Frequency::Month.label(ts(2000, 1, 2)), "2000-01");
        assert_eq!(Frequency::Year.label(ts(2000, 1, 2)), "2000");
    }
}
