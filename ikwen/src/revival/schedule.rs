//! Next run date of cyclic revivals.

use chrono::{Datelike, Duration, NaiveDate};

use crate::db::models::revivals::CyclicRevivalDBResponse;

/// How a cyclic revival repeats. The first rule that is set wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Every `n` days
    Days(i64),
    /// On these ISO weekdays, 1 = Monday to 7 = Sunday
    Weekdays(Vec<u32>),
    /// On these days of the month. A day past the end of a month runs on its last day.
    MonthDays(Vec<u32>),
}

impl Recurrence {
    pub fn of(revival: &CyclicRevivalDBResponse) -> Option<Self> {
        Self::from_rules(revival.days_cycle, &revival.day_of_week_list, &revival.day_of_month_list)
    }

    pub fn from_rules(days_cycle: Option<i32>, weekdays: &[i32], month_days: &[i32]) -> Option<Self> {
        if let Some(days) = days_cycle.filter(|d| *d > 0) {
            return Some(Recurrence::Days(days as i64));
        }
        let weekdays = sorted_in_range(weekdays, 1..=7);
        if !weekdays.is_empty() {
            return Some(Recurrence::Weekdays(weekdays));
        }
        let month_days = sorted_in_range(month_days, 1..=31);
        if !month_days.is_empty() {
            return Some(Recurrence::MonthDays(month_days));
        }
        None
    }

    /// First date strictly after `current` on which the revival runs
    pub fn next_after(&self, current: NaiveDate) -> Option<NaiveDate> {
        match self {
            Recurrence::Days(days) => current.checked_add_signed(Duration::days(*days)),
            Recurrence::Weekdays(weekdays) => {
                let today = current.weekday().number_from_monday();
                let ahead = match weekdays.iter().find(|w| **w > today) {
                    Some(next) => next - today,
                    None => weekdays[0] + 7 - today,
                };
                current.checked_add_signed(Duration::days(ahead as i64))
            }
            Recurrence::MonthDays(days) => {
                let length = days_in_month(current.year(), current.month())?;
                if let Some(day) = days.iter().map(|d| (*d).min(length)).find(|d| *d > current.day()) {
                    return current.with_day(day);
                }
                let (year, month) = if current.month() == 12 {
                    (current.year() + 1, 1)
                } else {
                    (current.year(), current.month() + 1)
                };
                let day = days[0].min(days_in_month(year, month)?);
                NaiveDate::from_ymd_opt(year, month, day)
            }
        }
    }
}

/// Date of the run following the one planned on `next_run_on`. `None` when the revival has no
/// usable recurrence rule.
pub fn next_run_date(revival: &CyclicRevivalDBResponse) -> Option<NaiveDate> {
    Recurrence::of(revival)?.next_after(revival.next_run_on)
}

fn sorted_in_range(values: &[i32], range: std::ops::RangeInclusive<i32>) -> Vec<u32> {
    let mut values: Vec<u32> = values.iter().filter(|v| range.contains(v)).map(|v| *v as u32).collect();
    values.sort_unstable();
    values.dedup();
    values
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((next - first).num_days() as u32)
}
