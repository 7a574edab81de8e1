// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;
use std::time::Instant;

use codec::{TimeDuration, Timestamp};

use crate::error::{Error, ErrorKind};

/// When a scheduled call should fire.
///
/// Exactly two variants: a specific wall-clock instant, or a recurring
/// interval.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleAt {
    /// Fire once at the given instant.
    Time(Timestamp),

    /// Fire repeatedly, `interval` apart.
    Interval(TimeDuration),
}

impl ScheduleAt {
    /// Wait from `now` until the next fire; zero if the instant has
    /// passed.
    #[must_use]
    pub fn to_duration_from(&self, now: Timestamp) -> TimeDuration {
        match self {
            Self::Time(at) => at.saturating_since(now),
            Self::Interval(interval) => *interval,
        }
    }

    /// Wall-clock time of the next fire seen from `now`.
    #[must_use]
    pub fn to_timestamp_from(&self, now: Timestamp) -> Timestamp {
        match self {
            Self::Time(at) => *at,
            Self::Interval(interval) => now + *interval,
        }
    }

    /// Validate the variant payload.
    ///
    /// # Errors
    ///
    /// Returns error for a non-positive interval or an out-of-range
    /// timestamp.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::Time(at) => {
                at.validate().map_err(Error::from)?;
                Ok(())
            }
            Self::Interval(interval) => {
                if interval.micros() <= 0 {
                    return Err(Error::new(
                        ErrorKind::SchedulerError,
                        "Schedule interval must be strictly positive",
                    ));
                }
                interval.validate().map_err(Error::from)
            }
        }
    }
}

impl fmt::Display for ScheduleAt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Time(at) => write!(f, "ScheduleAt(Time: {at})"),
            Self::Interval(interval) => write!(f, "ScheduleAt(Interval: {interval})"),
        }
    }
}

/// Monotonic stopwatch yielding [`TimeDuration`] readings.
#[derive(Debug)]
pub struct PrecisionTimer {
    started: Option<Instant>,
    elapsed: TimeDuration,
}

impl Default for PrecisionTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PrecisionTimer {
    /// Create a stopped timer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: None,
            elapsed: TimeDuration::zero(),
        }
    }

    /// Create a timer that is already running.
    #[must_use]
    pub fn started() -> Self {
        Self {
            started: Some(Instant::now()),
            elapsed: TimeDuration::zero(),
        }
    }

    /// Begin measuring. Restarting while running resets the segment.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop measuring and return the total elapsed time.
    pub fn stop(&mut self) -> TimeDuration {
        if let Some(started) = self.started.take() {
            self.elapsed = self.elapsed + TimeDuration::from_std(started.elapsed());
        }
        self.elapsed
    }

    /// Elapsed time without stopping.
    #[must_use]
    pub fn elapsed(&self) -> TimeDuration {
        match self.started {
            Some(started) => self.elapsed + TimeDuration::from_std(started.elapsed()),
            None => self.elapsed,
        }
    }

    /// Clear all recorded time.
    pub fn reset(&mut self) {
        self.started = None;
        self.elapsed = TimeDuration::zero();
    }

    /// Returns true while the timer is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.started.is_some()
    }
}

/// Run `f` and return its result with the measured duration.
pub fn time_block<T>(f: impl FnOnce() -> T) -> (T, TimeDuration) {
    let start = Instant::now();
    let result = f();
    (result, TimeDuration::from_std(start.elapsed()))
}
