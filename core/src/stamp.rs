/// Dual-representation instant: wire-format string plus numeric epoch.
///
/// The remote store speaks `timestamp without time zone` strings; local
/// ordering and checkpoint comparison use epoch milliseconds. `Stamp`
/// keeps both so no operation ever re-parses or re-formats in a loop.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stamp {
    iso: String,
    unix: i64,
}

impl Stamp {
    /// Canonical zero instant for uninitialized checkpoints
    pub fn zero() -> Self {
        Self::from_unix(0)
    }

    /// Current instant, wire form in naive UTC
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            iso: now.naive_utc().format(WIRE_FORMAT).to_string(),
            unix: now.timestamp_millis(),
        }
    }

    /// Strips a trailing `+HH:MM` / `+HHMM` offset segment, else identity
    pub fn fix_tz(stamp: &str) -> &str {
        match stamp.find('+') {
            Some(i) => &stamp[..i],
            None => stamp,
        }
    }

    /// Parses a wire-format string. Total: malformed input maps to epoch 0
    /// (implementation-defined, nothing relies on that value).
    pub fn from_iso(stamp: &str) -> Self {
        let normalized = Self::fix_tz(stamp);
        let unix = normalized
            .parse::<NaiveDateTime>()
            .map(|n| n.and_utc().timestamp_millis())
            .unwrap_or(0);
        Self {
            iso: normalized.to_string(),
            unix,
        }
    }

    pub fn from_unix(unix: i64) -> Self {
        let dt = DateTime::<Utc>::from_timestamp_millis(unix).unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            iso: dt.naive_utc().format(WIRE_FORMAT).to_string(),
            unix: dt.timestamp_millis(),
        }
    }

    /// Picks the later of the two instants
    pub fn max(a: Self, b: Self) -> Self {
        if a.unix > b.unix {
            a
        } else {
            b
        }
    }

    /// Timezone-normalized wire form
    pub fn iso(&self) -> &str {
        &self.iso
    }

    /// Epoch milliseconds
    pub fn unix(&self) -> i64 {
        self.unix
    }
}
