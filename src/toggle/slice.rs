// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time slices for the ledger.
//!
//! A slice id is the UTC time of day truncated to the slice width and written
//! `HH:MM:SS` (zero padded). Ids repeat every 24h, so ledger keys must expire
//! well before that.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};

pub const SECS_PER_DAY: u32 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceId {
    seconds_of_day: u32,
}

impl SliceId {
    #[must_use]
    pub fn seconds_of_day(self) -> u32 {
        self.seconds_of_day
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds_of_day;
        write!(f, "{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
    }
}

impl FromStr for SliceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return Err(format!("slice id must be HH:MM:SS, got '{}'", s));
        };
        let parse = |v: &str, max: u32| -> Result<u32, String> {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n < max)
                .ok_or_else(|| format!("bad slice component '{}' in '{}'", v, s))
        };
        Ok(Self { seconds_of_day: parse(*h, 24)? * 3600 + parse(*m, 60)? * 60 + parse(*sec, 60)? })
    }
}

/// Maps wall-clock time onto slice ids of a fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceClock {
    width_secs: u32,
}

impl SliceClock {
    /// `width_secs` must divide 60 (checked by config validation); 0 is treated as 1.
    pub fn new(width_secs: u32) -> Self {
        Self { width_secs: width_secs.max(1) }
    }

    #[must_use]
    pub fn width_secs(&self) -> u32 {
        self.width_secs
    }

    #[must_use]
    pub fn slice_at(&self, at: DateTime<Utc>) -> SliceId {
        let s = at.num_seconds_from_midnight();
        SliceId { seconds_of_day: s - s % self.width_secs }
    }

    /// The slice that just closed: one width before `at`.
    #[must_use]
    pub fn previous_at(&self, at: DateTime<Utc>) -> SliceId {
        self.slice_at(at - Duration::seconds(i64::from(self.width_secs)))
    }

    /// Seconds from the start of `slice` to `at`, assuming the slice is less than
    /// a day old.
    #[must_use]
    pub fn age_secs(&self, slice: SliceId, at: DateTime<Utc>) -> u32 {
        let now = at.num_seconds_from_midnight();
        (now + SECS_PER_DAY - slice.seconds_of_day) % SECS_PER_DAY
    }

    /// A slice is overdue once the flush that should have taken it has passed:
    /// it is neither current nor just closed.
    #[must_use]
    pub fn is_overdue(&self, slice: SliceId, at: DateTime<Utc>) -> bool {
        self.age_secs(slice, at) >= 2 * self.width_secs
    }
}
