use anyhow::Context;
use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::America::New_York;
use std::collections::HashSet;

// NYSE closes at 16:00 New York time. Before that, today's close is not final.
const CLOSE_CUTOFF_HOUR_NY: u32 = 16;
const CLOSE_CUTOFF_MINUTE_NY: u32 = 0;

pub const DEFAULT_RUN_TIME: &str = "09:30";

// Bounded search; a calendar with this many consecutive closed days is misconfigured.
const MAX_LOOKAHEAD_DAYS: i64 = 30;

/// NYSE full-day closures from the exchange's standing rules, plus any extra dates
/// (special closures) configured on top.
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    /// Extra closures via US_MARKET_HOLIDAYS="YYYY-MM-DD,YYYY-MM-DD".
    pub fn from_env() -> Self {
        let mut cal = Self::default();
        if let Ok(s) = std::env::var("US_MARKET_HOLIDAYS") {
            cal.extend_from_list(&s);
        }
        cal
    }

    pub fn extend_from_list(&mut self, s: &str) {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match NaiveDate::parse_from_str(part, "%Y-%m-%d") {
                Ok(d) => {
                    self.holidays.insert(d);
                }
                Err(_) => tracing::warn!(value = part, "ignoring unparsable market holiday"),
            }
        }
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date) && !is_exchange_holiday(date)
    }

    /// The calendar date for `arg`, or the most recent New York session whose close is final.
    pub fn resolve_as_of_date(
        &self,
        as_of_date_arg: Option<&str>,
        now_utc: DateTime<Utc>,
    ) -> anyhow::Result<NaiveDate> {
        if let Some(s) = as_of_date_arg {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("as-of date must be YYYY-MM-DD (got {s:?})"));
        }

        let now_ny = now_utc.with_timezone(&New_York);
        let cutoff_reached =
            (now_ny.hour(), now_ny.minute()) >= (CLOSE_CUTOFF_HOUR_NY, CLOSE_CUTOFF_MINUTE_NY);
        let mut date = now_ny.date_naive();
        if !cutoff_reached {
            date = date - Duration::days(1);
        }

        for _ in 0..MAX_LOOKAHEAD_DAYS {
            if self.is_business_day(date) {
                return Ok(date);
            }
            date = date - Duration::days(1);
        }
        anyhow::bail!("no business day within {MAX_LOOKAHEAD_DAYS} days before {now_utc}")
    }

    /// First business-day `run_time` (New York wall clock) strictly after `now_utc`.
    pub fn next_run_after(
        &self,
        now_utc: DateTime<Utc>,
        run_time: NaiveTime,
    ) -> anyhow::Result<DateTime<Utc>> {
        let mut date = now_utc.with_timezone(&New_York).date_naive();
        for _ in 0..MAX_LOOKAHEAD_DAYS {
            if self.is_business_day(date) {
                let local = New_York
                    .from_local_datetime(&date.and_time(run_time))
                    .earliest()
                    .with_context(|| format!("{date} {run_time} does not exist in New York"))?;
                let candidate = local.with_timezone(&Utc);
                if candidate > now_utc {
                    return Ok(candidate);
                }
            }
            date = date + Duration::days(1);
        }
        anyhow::bail!("no business day within {MAX_LOOKAHEAD_DAYS} days after {now_utc}")
    }
}

pub fn parse_run_time(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("schedule time must be HH:MM (got {s:?})"))
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_exchange_holiday(date: NaiveDate) -> bool {
    exchange_holidays(date.year()).contains(&date)
}

/// Observed NYSE holidays for `year`. Saturday holidays move to Friday and Sunday holidays to
/// Monday, except New Year's Day, which is not made up when it falls on a Saturday.
fn exchange_holidays(year: i32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(10);

    if let Some(d) = NaiveDate::from_ymd_opt(year, 1, 1) {
        if d.weekday() == Weekday::Sun {
            out.push(d + Duration::days(1));
        } else if d.weekday() != Weekday::Sat {
            out.push(d);
        }
    }

    let mut fixed = vec![(7, 4), (12, 25)];
    if year >= 2022 {
        fixed.push((6, 19));
    }
    for (m, d) in fixed {
        if let Some(d) = NaiveDate::from_ymd_opt(year, m, d) {
            out.push(observed(d));
        }
    }

    let nth = [
        (1, Weekday::Mon, 3),  // Martin Luther King Jr. Day
        (2, Weekday::Mon, 3),  // Washington's Birthday
        (9, Weekday::Mon, 1),  // Labor Day
        (11, Weekday::Thu, 4), // Thanksgiving
    ];
    for (m, wd, n) in nth {
        out.extend(NaiveDate::from_weekday_of_month_opt(year, m, wd, n));
    }

    // Memorial Day: last Monday of May.
    out.extend(
        NaiveDate::from_weekday_of_month_opt(year, 5, Weekday::Mon, 5)
            .or_else(|| NaiveDate::from_weekday_of_month_opt(year, 5, Weekday::Mon, 4)),
    );

    out.extend(easter_sunday(year).map(|d| d - Duration::days(2)));
    out
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)
}
