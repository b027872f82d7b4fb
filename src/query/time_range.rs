//! Relative time periods ("this month", "last 7 days", ...) turned into
//! concrete bound literals.
//!
//! Periods are computed at day granularity as half-open `[start, end)` ranges
//! and only then adjusted to the configured [`TimeBoundsPolicy`], so changing
//! inclusivity never changes which instants a period covers.

use super::Literal;
use crate::catalog::ColumnType;
use crate::rules::TimeBoundsPolicy;
use chrono::{Datelike, Days, Duration, Months, NaiveDate, NaiveTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
    ThisQuarter,
    LastQuarter,
    ThisYear,
    LastYear,
    /// `last N units`, ending with (and including) the reference day.
    Trailing { count: u32, unit: Unit },
}

impl Period {
    pub fn parse(description: &str) -> Option<Period> {
        let lowered = description.trim().to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        let period = match words.as_slice() {
            ["today"] => Period::Today,
            ["yesterday"] => Period::Yesterday,
            ["this", "week"] => Period::ThisWeek,
            ["last", "week"] | ["previous", "week"] => Period::LastWeek,
            ["this", "month"] => Period::ThisMonth,
            ["last", "month"] | ["previous", "month"] => Period::LastMonth,
            ["this", "quarter"] => Period::ThisQuarter,
            ["last", "quarter"] | ["previous", "quarter"] => Period::LastQuarter,
            ["this", "year"] => Period::ThisYear,
            ["last", "year"] | ["previous", "year"] => Period::LastYear,
            ["last" | "past", count, unit] => {
                let count: u32 = count.parse().ok().filter(|count| *count > 0)?;
                let unit = match *unit {
                    "day" | "days" => Unit::Day,
                    "week" | "weeks" => Unit::Week,
                    "month" | "months" => Unit::Month,
                    _ => return None,
                };
                Period::Trailing { count, unit }
            }
            _ => return None,
        };
        Some(period)
    }

    /// Half-open `[start, end)` day range relative to `today`.
    pub fn bounds(&self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        let tomorrow = today.checked_add_days(Days::new(1))?;
        match self {
            Period::Today => Some((today, tomorrow)),
            Period::Yesterday => Some((today.checked_sub_days(Days::new(1))?, today)),
            Period::ThisWeek => {
                let start = week_start(today)?;
                Some((start, start.checked_add_days(Days::new(7))?))
            }
            Period::LastWeek => {
                let end = week_start(today)?;
                Some((end.checked_sub_days(Days::new(7))?, end))
            }
            Period::ThisMonth => {
                let start = month_start(today)?;
                Some((start, start.checked_add_months(Months::new(1))?))
            }
            Period::LastMonth => {
                let end = month_start(today)?;
                Some((end.checked_sub_months(Months::new(1))?, end))
            }
            Period::ThisQuarter => {
                let start = quarter_start(today)?;
                Some((start, start.checked_add_months(Months::new(3))?))
            }
            Period::LastQuarter => {
                let end = quarter_start(today)?;
                Some((end.checked_sub_months(Months::new(3))?, end))
            }
            Period::ThisYear => {
                let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
                Some((start, NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)?))
            }
            Period::LastYear => Some((
                NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)?,
                NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
            )),
            Period::Trailing { count, unit } => {
                let start = match unit {
                    Unit::Day => tomorrow.checked_sub_days(Days::new(u64::from(*count)))?,
                    Unit::Week => tomorrow.checked_sub_days(Days::new(7 * u64::from(*count)))?,
                    Unit::Month => tomorrow.checked_sub_months(Months::new(*count))?,
                };
                Some((start, tomorrow))
            }
        }
    }
}

fn week_start(day: NaiveDate) -> Option<NaiveDate> {
    day.checked_sub_days(Days::new(u64::from(day.weekday().num_days_from_monday())))
}

fn month_start(day: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(day.year(), day.month(), 1)
}

fn quarter_start(day: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(day.year(), (day.month0() / 3) * 3 + 1, 1)
}

/// Lower and upper bound literals for `description`, typed for the time column.
///
/// Date columns get date literals; every other column type gets timestamps at
/// midnight. Returns `None` when the description is not a known period.
pub fn resolve_bounds(
    description: &str,
    today: NaiveDate,
    column_type: &ColumnType,
    policy: TimeBoundsPolicy,
) -> Option<(Literal, Literal)> {
    let (start, end) = Period::parse(description)?.bounds(today)?;

    if matches!(column_type, ColumnType::Date) {
        let lower = if policy.lower_inclusive {
            start
        } else {
            start.checked_sub_days(Days::new(1))?
        };
        let upper = if policy.upper_inclusive {
            end.checked_sub_days(Days::new(1))?
        } else {
            end
        };
        return Some((Literal::Date(lower), Literal::Date(upper)));
    }

    let start = start.and_time(NaiveTime::MIN);
    let end = end.and_time(NaiveTime::MIN);
    let lower = if policy.lower_inclusive {
        start
    } else {
        start - Duration::seconds(1)
    };
    let upper = if policy.upper_inclusive {
        end - Duration::seconds(1)
    } else {
        end
    };
    Some((Literal::Timestamp(lower), Literal::Timestamp(upper)))
}
