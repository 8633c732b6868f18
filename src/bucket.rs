//! Bucket math: timeframe definitions, bucket flooring and the
//! regular-trading-hours predicate.
//!
//! Intraday buckets are anchored to the 09:30 America/New_York market open
//! of the timestamp's trading date, so 5T/15T/30T/1H/4H buckets land
//! exactly on session boundaries. Day-or-longer buckets align to plain
//! epoch boundaries. Everything here is pure.

use crate::errors::FeederError;
use chrono::{DateTime, Datelike, Duration, LocalResult, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use std::fmt;

/// Candle timeframes supported by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    /// The higher timeframes maintained by the rollup path, in ascending order.
    pub const HIGHER: [Timeframe; 6] = [
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Min30,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
    ];

    /// Storage label for this timeframe.
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1T",
            Timeframe::Min5 => "5T",
            Timeframe::Min15 => "15T",
            Timeframe::Min30 => "30T",
            Timeframe::Hour1 => "1H",
            Timeframe::Hour4 => "4H",
            Timeframe::Day1 => "1D",
        }
    }

    /// Length of one bucket.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::Min1 => Duration::minutes(1),
            Timeframe::Min5 => Duration::minutes(5),
            Timeframe::Min15 => Duration::minutes(15),
            Timeframe::Min30 => Duration::minutes(30),
            Timeframe::Hour1 => Duration::hours(1),
            Timeframe::Hour4 => Duration::hours(4),
            Timeframe::Day1 => Duration::days(1),
        }
    }

    /// True for timeframes shorter than one day (session-anchored buckets).
    pub fn is_intraday(&self) -> bool {
        self.duration() < Duration::days(1)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = FeederError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1T" => Ok(Timeframe::Min1),
            "5T" => Ok(Timeframe::Min5),
            "15T" => Ok(Timeframe::Min15),
            "30T" => Ok(Timeframe::Min30),
            "1H" => Ok(Timeframe::Hour1),
            "4H" => Ok(Timeframe::Hour4),
            "1D" => Ok(Timeframe::Day1),
            other => Err(FeederError::config(format!(
                "unknown timeframe label: {}",
                other
            ))),
        }
    }
}

/// Truncate a tick timestamp to its containing minute.
pub fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(60);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// Floor a timestamp to the start of its containing bucket.
///
/// Sub-day timeframes are anchored at 09:30 America/New_York on the
/// timestamp's local trading date; buckets extend forward and backward from
/// that anchor on a fixed grid, so pre-market timestamps also land on
/// grid-aligned starts. Day-or-longer timeframes floor against the epoch.
pub fn floor_to_bucket(ts: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    let bucket_secs = tf.duration().num_seconds();

    if !tf.is_intraday() {
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(bucket_secs);
        return DateTime::from_timestamp(floored, 0).unwrap_or(ts);
    }

    let local = ts.with_timezone(&New_York);
    let anchor = match New_York.with_ymd_and_hms(local.year(), local.month(), local.day(), 9, 30, 0)
    {
        LocalResult::Single(a) => a.with_timezone(&Utc),
        LocalResult::Ambiguous(a, _) => a.with_timezone(&Utc),
        // 09:30 never falls inside a New York DST transition; if the local
        // date is somehow unrepresentable, fall back to epoch alignment.
        LocalResult::None => {
            let secs = ts.timestamp();
            let floored = secs - secs.rem_euclid(bucket_secs);
            return DateTime::from_timestamp(floored, 0).unwrap_or(ts);
        }
    };

    let offset = ts.timestamp() - anchor.timestamp();
    let floored_offset = offset - offset.rem_euclid(bucket_secs);
    anchor + Duration::seconds(floored_offset)
}

/// Whether a timestamp falls inside US equities regular trading hours:
/// Monday through Friday, 09:30 (inclusive) to 16:00 (exclusive)
/// America/New_York. Crypto bypasses this check at the call site.
///
/// The conversion is total, so unlike a wall-clock lookup there is no
/// failure path here; callers must not drop data on anything but an
/// explicit `false`.
pub fn is_regular_trading_hours(ts: DateTime<Utc>) -> bool {
    let local = ts.with_timezone(&New_York);

    match local.weekday() {
        Weekday::Sat | Weekday::Sun => return false,
        _ => {}
    }

    let minutes = local.hour() * 60 + local.minute();
    (570..960).contains(&minutes)
}
