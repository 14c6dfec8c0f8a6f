use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// The precision that metric timestamps are rounded to when they are created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Precision {
    /// Keep the full timestamp.
    #[default]
    #[serde(rename = "ns")]
    Nanosecond,
    /// Round to the nearest microsecond.
    #[serde(rename = "us")]
    Microsecond,
    /// Round to the nearest millisecond.
    #[serde(rename = "ms")]
    Millisecond,
    /// Round to the nearest second.
    #[serde(rename = "s")]
    Second,
}

impl Precision {
    /// Returns the duration of one unit of this precision.
    pub fn as_duration(self) -> Duration {
        match self {
            Self::Nanosecond => Duration::from_nanos(1),
            Self::Microsecond => Duration::from_micros(1),
            Self::Millisecond => Duration::from_millis(1),
            Self::Second => Duration::from_secs(1),
        }
    }

    /// Rounds the timestamp to the nearest multiple of this precision.
    ///
    /// Halfway values are rounded up. Timestamps that cannot be rounded without overflowing are
    /// returned unchanged.
    pub fn round(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let unit = match self {
            Self::Nanosecond => return timestamp,
            Self::Microsecond => TimeDelta::microseconds(1),
            Self::Millisecond => TimeDelta::milliseconds(1),
            Self::Second => TimeDelta::seconds(1),
        };

        timestamp.duration_round(unit).unwrap_or(timestamp)
    }
}
