// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::base::{DecodeValue, EncodeValue};
use crate::error::{DecodeError, EncodeError, TimeError};
use crate::reader::Reader;
use crate::writer::Writer;

pub const MICROS_PER_MILLI: i64 = 1_000;
pub const MICROS_PER_SEC: i64 = 1_000_000;
pub const MICROS_PER_MIN: i64 = 60 * MICROS_PER_SEC;
pub const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MIN;
pub const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Durations above roughly 1000 years are rejected by validation.
const MAX_DURATION_MICROS: i64 = 1000 * 365 * MICROS_PER_DAY;

/// Timestamps beyond roughly year 3000 are rejected by validation.
const MAX_TIMESTAMP_MICROS: i64 = 32_503_680_000 * MICROS_PER_SEC;

/// Signed span of time in microseconds.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub struct TimeDuration {
    micros: i64,
}

impl TimeDuration {
    /// The zero-length duration.
    #[must_use]
    pub const fn zero() -> Self {
        Self { micros: 0 }
    }

    /// Wrap a microsecond count.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Whole milliseconds as a duration.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * MICROS_PER_MILLI,
        }
    }

    /// Whole seconds as a duration.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * MICROS_PER_SEC,
        }
    }

    /// Whole minutes as a duration.
    #[must_use]
    pub const fn from_mins(mins: i64) -> Self {
        Self {
            micros: mins * MICROS_PER_MIN,
        }
    }

    /// Microsecond count of this duration.
    #[must_use]
    pub const fn micros(&self) -> i64 {
        self.micros
    }

    /// This duration in whole milliseconds, truncated.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.micros / MICROS_PER_MILLI
    }

    /// This duration in seconds.
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.micros as f64 / MICROS_PER_SEC as f64
    }

    /// Returns true if this duration is negative.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.micros < 0
    }

    /// Convert a std duration, saturating at the i64 ceiling.
    #[must_use]
    pub fn from_std(duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Self { micros }
    }

    /// Convert into a std duration.
    ///
    /// # Errors
    ///
    /// Returns error if this duration is negative.
    pub fn to_std(&self) -> Result<Duration, TimeError> {
        if self.micros < 0 {
            return Err(TimeError::DurationOutOfRange(self.micros));
        }
        Ok(Duration::from_micros(self.micros as u64))
    }

    /// Check this duration against the supported ceiling.
    ///
    /// # Errors
    ///
    /// Returns error if the magnitude exceeds roughly 1000 years.
    pub fn validate(&self) -> Result<(), TimeError> {
        if self.micros.abs() > MAX_DURATION_MICROS {
            return Err(TimeError::DurationOutOfRange(self.micros));
        }
        Ok(())
    }

    /// Human-readable form like `2h 15m 30s`.
    #[must_use]
    pub fn format_human(&self) -> String {
        let total = self.micros.abs();
        let sign = if self.micros < 0 { "-" } else { "" };
        if total < MICROS_PER_MILLI {
            return format!("{sign}{total}us");
        }
        if total < MICROS_PER_SEC {
            return format!("{sign}{}ms", total / MICROS_PER_MILLI);
        }
        let days = total / MICROS_PER_DAY;
        let hours = (total % MICROS_PER_DAY) / MICROS_PER_HOUR;
        let mins = (total % MICROS_PER_HOUR) / MICROS_PER_MIN;
        let secs = (total % MICROS_PER_MIN) / MICROS_PER_SEC;
        let mut parts = Vec::new();
        if days > 0 {
            parts.push(format!("{days}d"));
        }
        if hours > 0 {
            parts.push(format!("{hours}h"));
        }
        if mins > 0 {
            parts.push(format!("{mins}m"));
        }
        if secs > 0 || parts.is_empty() {
            parts.push(format!("{secs}s"));
        }
        format!("{sign}{}", parts.join(" "))
    }
}

impl fmt::Display for TimeDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.format_human())
    }
}

impl Add for TimeDuration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            micros: self.micros.saturating_add(rhs.micros),
        }
    }
}

impl Sub for TimeDuration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            micros: self.micros.saturating_sub(rhs.micros),
        }
    }
}

impl Mul<i64> for TimeDuration {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self {
        Self {
            micros: self.micros.saturating_mul(rhs),
        }
    }
}

impl Div<i64> for TimeDuration {
    type Output = Self;

    fn div(self, rhs: i64) -> Self {
        Self {
            micros: if rhs == 0 { 0 } else { self.micros / rhs },
        }
    }
}

impl Div for TimeDuration {
    type Output = i64;

    /// Whole number of times `rhs` fits into this duration.
    fn div(self, rhs: Self) -> i64 {
        if rhs.micros == 0 {
            0
        } else {
            self.micros / rhs.micros
        }
    }
}

impl EncodeValue for TimeDuration {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_i64(self.micros)
    }
}

impl DecodeValue for TimeDuration {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self::from_micros(reader.read_i64()?))
    }
}

/// Point in time, signed microseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// The Unix epoch.
    #[must_use]
    pub const fn epoch() -> Self {
        Self {
            micros_since_epoch: 0,
        }
    }

    /// Wrap a microsecond count since the Unix epoch.
    #[must_use]
    pub const fn from_micros(micros_since_epoch: i64) -> Self {
        Self { micros_since_epoch }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self {
            micros_since_epoch: micros,
        }
    }

    /// Microseconds since the Unix epoch.
    #[must_use]
    pub const fn micros(&self) -> i64 {
        self.micros_since_epoch
    }

    /// Duration from `earlier` to this timestamp, clamped at zero.
    #[must_use]
    pub fn saturating_since(&self, earlier: Self) -> TimeDuration {
        let diff = self.micros_since_epoch.saturating_sub(earlier.micros_since_epoch);
        TimeDuration::from_micros(diff.max(0))
    }

    /// Parse an ISO-8601 / RFC 3339 string.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not a valid instant.
    pub fn parse_iso(s: &str) -> Result<Self, TimeError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| TimeError::InvalidFormat(s.to_string()))?;
        Ok(Self {
            micros_since_epoch: dt.timestamp_micros(),
        })
    }

    /// RFC 3339 form in UTC.
    #[must_use]
    pub fn to_iso(&self) -> String {
        self.to_datetime().to_rfc3339()
    }

    /// UTC calendar form of this timestamp.
    #[must_use]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.micros_since_epoch)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Calendar form of this timestamp in a fixed offset timezone.
    #[must_use]
    pub fn to_datetime_in(&self, offset: FixedOffset) -> DateTime<FixedOffset> {
        self.to_datetime().with_timezone(&offset)
    }

    /// Check this timestamp against the far-future ceiling.
    ///
    /// # Errors
    ///
    /// Returns error if the timestamp lies beyond roughly year 3000.
    pub fn validate(&self) -> Result<(), TimeError> {
        if self.micros_since_epoch > MAX_TIMESTAMP_MICROS {
            return Err(TimeError::TimestampOutOfRange(self.micros_since_epoch));
        }
        Ok(())
    }

    /// Check this timestamp is at or after the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns error on a pre-epoch timestamp.
    pub fn validate_non_negative(&self) -> Result<(), TimeError> {
        if self.micros_since_epoch < 0 {
            return Err(TimeError::NegativeTimestamp(self.micros_since_epoch));
        }
        Ok(())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_iso())
    }
}

impl Add<TimeDuration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: TimeDuration) -> Self {
        Self {
            micros_since_epoch: self.micros_since_epoch.saturating_add(rhs.micros()),
        }
    }
}

impl Sub<TimeDuration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: TimeDuration) -> Self {
        Self {
            micros_since_epoch: self.micros_since_epoch.saturating_sub(rhs.micros()),
        }
    }
}

impl Sub for Timestamp {
    type Output = TimeDuration;

    fn sub(self, rhs: Self) -> TimeDuration {
        TimeDuration::from_micros(self.micros_since_epoch.saturating_sub(rhs.micros_since_epoch))
    }
}

impl EncodeValue for Timestamp {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_i64(self.micros_since_epoch)
    }
}

impl DecodeValue for Timestamp {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self::from_micros(reader.read_i64()?))
    }
}
