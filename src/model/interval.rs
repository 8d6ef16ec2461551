//! Supported timeframes and bar-alignment arithmetic.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the seven supported candle timeframes. Canonical spellings are
/// fixed exactly (`1D`/`1W` are capitalized; the rest are lowercase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
    OneWeek,
}

impl Interval {
    /// All supported intervals, in canonical order.
    pub const ALL: [Interval; 7] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::OneHour,
        Interval::FourHours,
        Interval::OneDay,
        Interval::OneWeek,
    ];

    /// Bar duration in milliseconds.
    #[must_use]
    pub const fn duration_ms(self) -> i64 {
        match self {
            Interval::OneMinute => 60_000,
            Interval::FiveMinutes => 300_000,
            Interval::FifteenMinutes => 900_000,
            Interval::OneHour => 3_600_000,
            Interval::FourHours => 14_400_000,
            Interval::OneDay => 86_400_000,
            Interval::OneWeek => 604_800_000,
        }
    }

    /// Canonical wire spelling, used both for serialization and for
    /// rendering the valid-interval list in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1D",
            Interval::OneWeek => "1W",
        }
    }

    /// Parse the canonical wire spelling. Returns `None` for anything else,
    /// including case variants — spellings are fixed exactly.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_str() == raw)
    }

    /// Render the full valid-interval list for the `error` reply:
    /// `"1m, 5m, 15m, 1h, 4h, 1D, 1W"`.
    #[must_use]
    pub fn valid_list() -> String {
        Self::ALL
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Align `time` to this interval's bar start (floor division on epoch
    /// milliseconds). The `1W` bucket is intentionally pure epoch-modulus
    /// arithmetic, not ISO-week.
    #[must_use]
    pub fn bar_start(self, time: DateTime<Utc>) -> DateTime<Utc> {
        let ms = time.timestamp_millis();
        let dur = self.duration_ms();
        let floored = ms.div_euclid(dur) * dur;
        Utc.timestamp_millis_opt(floored).single().unwrap_or(time)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Interval::parse(&value).ok_or(value)
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}
