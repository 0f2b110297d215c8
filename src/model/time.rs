//! Time grains, time ranges and ISO 8601 durations.

use std::fmt;
use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Truncation grain for time dimensions. Ordered from finest to coarsest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn is_specified(self) -> bool {
        self != TimeGrain::Unspecified
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeGrain::Unspecified => "",
            TimeGrain::Millisecond => "millisecond",
            TimeGrain::Second => "second",
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }

    /// Truncate a timestamp (in UTC) to the start of its bucket.
    pub fn truncate(
        self,
        t: DateTime<Utc>,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> DateTime<Utc> {
        let date = t.date_naive();
        let truncated = match self {
            TimeGrain::Unspecified => return t,
            TimeGrain::Millisecond => {
                let nanos = t.nanosecond() / 1_000_000 * 1_000_000;
                return t.with_nanosecond(nanos).unwrap_or(t);
            }
            TimeGrain::Second => return t.with_nanosecond(0).unwrap_or(t),
            TimeGrain::Minute => {
                return t.with_nanosecond(0).and_then(|t| t.with_second(0)).unwrap_or(t)
            }
            TimeGrain::Hour => {
                return t
                    .with_nanosecond(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_minute(0))
                    .unwrap_or(t)
            }
            TimeGrain::Day => date,
            TimeGrain::Week => {
                let fdow = first_day_of_week.clamp(1, 7);
                let dow = date.weekday().number_from_monday();
                let back = (dow + 7 - fdow) % 7;
                date - Duration::days(back as i64)
            }
            TimeGrain::Month => date.with_day(1).unwrap_or(date),
            TimeGrain::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
            }
            TimeGrain::Year => {
                let fmoy = first_month_of_year.clamp(1, 12);
                let year = if date.month() >= fmoy {
                    date.year()
                } else {
                    date.year() - 1
                };
                NaiveDate::from_ymd_opt(year, fmoy, 1).unwrap_or(date)
            }
        };
        Utc.from_utc_datetime(&truncated.and_time(NaiveTime::MIN))
    }

    /// Advance a timestamp by one unit of this grain.
    pub fn add_one(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeGrain::Unspecified => None,
            TimeGrain::Millisecond => t.checked_add_signed(Duration::milliseconds(1)),
            TimeGrain::Second => t.checked_add_signed(Duration::seconds(1)),
            TimeGrain::Minute => t.checked_add_signed(Duration::minutes(1)),
            TimeGrain::Hour => t.checked_add_signed(Duration::hours(1)),
            TimeGrain::Day => t.checked_add_signed(Duration::days(1)),
            TimeGrain::Week => t.checked_add_signed(Duration::weeks(1)),
            TimeGrain::Month => t.checked_add_months(Months::new(1)),
            TimeGrain::Quarter => t.checked_add_months(Months::new(3)),
            TimeGrain::Year => t.checked_add_months(Months::new(12)),
        }
    }
}

impl TimeGrain {
    /// Truncate `t` to the start of its bucket in the wall clock of `tz`.
    pub fn truncate_in(
        self,
        t: DateTime<Utc>,
        tz: Option<Tz>,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<DateTime<Utc>> {
        let Some(tz) = tz else {
            return Ok(self.truncate(t, first_day_of_week, first_month_of_year));
        };
        let local = Utc.from_utc_datetime(&t.with_timezone(&tz).naive_local());
        let truncated = self.truncate(local, first_day_of_week, first_month_of_year);
        from_local(tz, truncated.naive_utc())
    }

    /// Advance `t` by one unit of this grain in the wall clock of `tz`.
    pub fn add_one_in(self, t: DateTime<Utc>, tz: Option<Tz>) -> Result<DateTime<Utc>> {
        let out_of_range = || Error::validation("time exceeds the supported time range");
        match tz {
            Some(tz) if self >= TimeGrain::Day => {
                let local = Utc.from_utc_datetime(&t.with_timezone(&tz).naive_local());
                let next = self.add_one(local).ok_or_else(out_of_range)?;
                from_local(tz, next.naive_utc())
            }
            _ => self.add_one(t).ok_or_else(out_of_range),
        }
    }
}

/// The UTC instant of a wall clock time in `tz`.
///
/// Ambiguous times take the earlier instant. Times skipped by a DST
/// transition move forward by the gap.
fn from_local(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            let later = local.checked_add_signed(Duration::hours(1))?;
            tz.from_local_datetime(&later).earliest()
        })
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            Error::validation(format!("{} does not exist in time zone {}", local, tz))
        })
}

/// Parse a time zone name. UTC aliases and the empty name give `None`.
pub fn parse_time_zone(tz: &str) -> Result<Option<Tz>> {
    let tz = normalize_time_zone(tz)?;
    if tz.is_empty() {
        return Ok(None);
    }
    tz.parse::<Tz>()
        .map(Some)
        .map_err(|_| Error::validation(format!("unknown time zone {:?}", tz)))
}

impl fmt::Display for TimeGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A time range filter. Either resolved (`start`/`end`) or relative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub expression: Option<String>,
    pub iso_duration: Option<String>,
    pub iso_offset: Option<String>,
    pub round_to_grain: TimeGrain,
    pub time_dimension: Option<String>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    /// Whether the range filters nothing at all.
    pub fn is_zero(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.expression.is_none()
            && self.iso_duration.is_none()
            && self.iso_offset.is_none()
            && !self.round_to_grain.is_specified()
    }

    /// Whether only absolute bounds are set.
    pub fn is_resolved(&self) -> bool {
        self.expression.is_none()
            && self.iso_duration.is_none()
            && self.iso_offset.is_none()
            && !self.round_to_grain.is_specified()
    }
}

/// A filtered select of the dimension domain used as a join driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereSpine {
    pub expr: crate::model::Expression,
}

/// A generated series of time bins used as a join driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSpine {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub grain: TimeGrain,
    #[serde(default)]
    pub time_dimension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Spine {
    #[serde(rename = "where")]
    pub where_spine: Option<WhereSpine>,
    pub time: Option<TimeSpine>,
}

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
    )
    .unwrap()
});

/// A parsed ISO 8601 duration such as `P7D` or `PT6H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("invalid ISO 8601 duration {:?}", s));
        let caps = ISO_DURATION.captures(s).ok_or_else(invalid)?;
        if s == "P" || s.ends_with('T') {
            return Err(invalid());
        }
        let part = |i: usize| -> Result<u32> {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>().map_err(|_| invalid()))
                .unwrap_or(Ok(0))
        };
        Ok(Self {
            years: part(1)?,
            months: part(2)?,
            weeks: part(3)?,
            days: part(4)?,
            hours: part(5)?,
            minutes: part(6)?,
            seconds: part(7)?,
        })
    }

    /// Subtract this duration from `t`.
    pub fn sub_from(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let t = t.checked_sub_months(Months::new(months))?;
        let span = Duration::weeks(self.weeks as i64)
            + Duration::days(self.days as i64)
            + Duration::hours(self.hours as i64)
            + Duration::minutes(self.minutes as i64)
            + Duration::seconds(self.seconds as i64);
        t.checked_sub_signed(span)
    }
}

static TIME_ZONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z][A-Za-z0-9_+\-]*(?:/[A-Za-z0-9_+\-]+)*)?$").unwrap()
});

/// Normalize a time zone name. UTC aliases become empty.
pub fn normalize_time_zone(tz: &str) -> Result<String> {
    if !TIME_ZONE.is_match(tz) {
        return Err(Error::validation(format!("invalid time zone {:?}", tz)));
    }
    match tz {
        "UTC" | "Etc/UTC" => Ok(String::new()),
        _ => Ok(tz.to_string()),
    }
}
