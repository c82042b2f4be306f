use crate::error::{AppError, AppResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPattern {
    #[default]
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RepeatPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn from_db(value: &str) -> AppResult<Self> {
        match value {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(AppError::validation(format!("Invalid repeat pattern: {}", value))),
        }
    }
}

/// Recurrence settings carried by a parent task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    pub pattern: RepeatPattern,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Weekly only. Empty means "same weekday as the anchor".
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// Monthly only. 0 keeps the anchor's day of month.
    #[serde(default)]
    pub day_of_month: u32,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_count: u32,
}

fn default_interval() -> u32 {
    1
}

impl RecurrenceRule {
    pub fn validate(&self) -> AppResult<()> {
        if self.interval == 0 {
            return Err(AppError::validation("Repeat interval must be at least 1"));
        }
        if self.day_of_month > 31 {
            return Err(AppError::validation("Day of month must be between 0 and 31"));
        }
        if !self.days_of_week.is_empty() && self.pattern != RepeatPattern::Weekly {
            return Err(AppError::validation(
                "Days of week apply only to weekly recurrence",
            ));
        }
        if self.day_of_month != 0 && self.pattern != RepeatPattern::Monthly {
            return Err(AppError::validation(
                "Day of month applies only to monthly recurrence",
            ));
        }
        Ok(())
    }

    /// The first occurrence of a series anchored at `anchor`: the anchor
    /// itself when it satisfies the rule, otherwise the next eligible slot.
    pub fn first_occurrence(&self, anchor: DateTime<Utc>, produced: i64) -> Option<DateTime<Utc>> {
        if self.exhausted(produced) {
            return None;
        }
        let candidate = if self.anchor_is_eligible(anchor) {
            Some(anchor)
        } else {
            self.step(anchor, anchor)
        };
        candidate.filter(|at| self.within_end(*at))
    }

    /// The next occurrence strictly after `cursor`, or `None` once the
    /// series has reached its end date or its maximum count.
    pub fn next_occurrence(
        &self,
        anchor: DateTime<Utc>,
        produced: i64,
        cursor: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.exhausted(produced) {
            return None;
        }
        self.step(anchor, cursor).filter(|at| self.within_end(*at))
    }

    /// Jumps from the occurrence `cursor` toward `horizon`, landing on an
    /// occurrence of the same series that is still before `horizon`. The
    /// result is never earlier than `cursor`, and a few `next_occurrence`
    /// steps from it reach the horizon whatever the size of the gap.
    pub fn fast_forward(
        &self,
        anchor: DateTime<Utc>,
        cursor: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if cursor >= horizon {
            return cursor;
        }
        let interval = i64::from(self.interval.max(1));
        let jumped = match self.pattern {
            RepeatPattern::Daily | RepeatPattern::Weekly => {
                // Whole periods keep the weekday and the week parity of listed days.
                let days = if self.pattern == RepeatPattern::Daily {
                    interval
                } else {
                    7 * interval
                };
                let period = Duration::days(days).num_seconds();
                let periods = ((horizon - cursor).num_seconds() - 1) / period;
                periods
                    .checked_mul(period)
                    .and_then(|secs| cursor.checked_add_signed(Duration::seconds(secs)))
            }
            RepeatPattern::Monthly => {
                let months = (i64::from(horizon.year()) - i64::from(cursor.year())) * 12
                    + i64::from(horizon.month0())
                    - i64::from(cursor.month0());
                let day = if self.day_of_month == 0 {
                    anchor.day()
                } else {
                    self.day_of_month
                };
                u32::try_from((months / interval - 1).max(0) * interval)
                    .ok()
                    .and_then(|shift| add_months_clamped(cursor, shift, day))
            }
            RepeatPattern::Yearly => {
                let years = i64::from(horizon.year()) - i64::from(cursor.year());
                let shift = (years / interval - 1).max(0) * interval;
                i32::try_from(i64::from(cursor.year()) + shift)
                    .ok()
                    .and_then(|year| {
                        let day = anchor.day().min(days_in_month(year, anchor.month()));
                        NaiveDate::from_ymd_opt(year, anchor.month(), day)
                    })
                    .map(|date| date.and_time(cursor.time()).and_utc())
            }
        };
        jumped
            .filter(|at| *at >= cursor && *at < horizon)
            .unwrap_or(cursor)
    }

    fn exhausted(&self, produced: i64) -> bool {
        self.max_count > 0 && produced >= i64::from(self.max_count)
    }

    fn within_end(&self, at: DateTime<Utc>) -> bool {
        self.end_date.map_or(true, |end| at <= end)
    }

    fn anchor_is_eligible(&self, anchor: DateTime<Utc>) -> bool {
        match self.pattern {
            RepeatPattern::Weekly if !self.days_of_week.is_empty() => {
                self.days_of_week.contains(&anchor.weekday())
            }
            RepeatPattern::Monthly if self.day_of_month != 0 => {
                let wanted = self
                    .day_of_month
                    .min(days_in_month(anchor.year(), anchor.month()));
                anchor.day() == wanted
            }
            _ => true,
        }
    }

    fn step(&self, anchor: DateTime<Utc>, cursor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = i64::from(self.interval.max(1));
        match self.pattern {
            RepeatPattern::Daily => cursor.checked_add_signed(Duration::days(interval)),
            RepeatPattern::Weekly if self.days_of_week.is_empty() => {
                cursor.checked_add_signed(Duration::days(7 * interval))
            }
            RepeatPattern::Weekly => self.next_listed_weekday(anchor, cursor, interval),
            RepeatPattern::Monthly => {
                let day = if self.day_of_month == 0 {
                    anchor.day()
                } else {
                    self.day_of_month
                };
                add_months_clamped(cursor, self.interval, day)
            }
            RepeatPattern::Yearly => {
                let year = cursor.year().checked_add(i32::try_from(self.interval).ok()?)?;
                let day = anchor.day().min(days_in_month(year, anchor.month()));
                NaiveDate::from_ymd_opt(year, anchor.month(), day)
                    .map(|date| date.and_time(cursor.time()).and_utc())
            }
        }
    }

    // Weeks are counted from the Sunday that starts the anchor's week; only
    // weeks at a multiple of `interval` from it are eligible.
    fn next_listed_weekday(
        &self,
        anchor: DateTime<Utc>,
        cursor: DateTime<Utc>,
        interval: i64,
    ) -> Option<DateTime<Utc>> {
        let anchor_week_start = anchor.date_naive()
            - Duration::days(i64::from(anchor.weekday().num_days_from_sunday()));

        for offset in 1..=(7 * interval + 7) {
            let candidate = cursor.checked_add_signed(Duration::days(offset))?;
            if !self.days_of_week.contains(&candidate.weekday()) {
                continue;
            }
            let weeks = (candidate.date_naive() - anchor_week_start)
                .num_days()
                .div_euclid(7);
            if weeks.rem_euclid(interval) == 0 {
                return Some(candidate);
            }
        }
        None
    }
}

fn add_months_clamped(cursor: DateTime<Utc>, months: u32, day: u32) -> Option<DateTime<Utc>> {
    let total = i64::from(cursor.year()) * 12 + i64::from(cursor.month0()) + i64::from(months);
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let day = day.max(1).min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(cursor.time()).and_utc())
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

pub fn weekday_to_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "sun",
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
    }
}

/// Accepts short or long English names in any case.
pub fn parse_weekday(value: &str) -> AppResult<Weekday> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| AppError::validation(format!("Invalid day of week: {}", value)))
}

/// Comma separated, Sunday-first order, duplicates removed.
pub fn encode_days(days: &[Weekday]) -> String {
    let mut sorted: Vec<Weekday> = days.to_vec();
    sorted.sort_by_key(|d| d.num_days_from_sunday());
    sorted.dedup();
    sorted
        .into_iter()
        .map(weekday_to_str)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_days(raw: &str) -> AppResult<Vec<Weekday>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_weekday)
        .collect()
}
