//! Window identity and bounds

use chrono::{DateTime, Utc};
use llm_telemetry_types::DimensionKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time range `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: i64,
    pub end: i64,
}

impl WindowBounds {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        millis_to_datetime(self.start)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        millis_to_datetime(self.end)
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start_time().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end_time().format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

/// Identifies one aggregation row: a window start plus a dimension key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub window_start: i64,
    pub dimension_key: DimensionKey,
}

impl WindowKey {
    pub fn new(window_start: i64, dimension_key: DimensionKey) -> Self {
        Self {
            window_start,
            dimension_key,
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            millis_to_datetime(self.window_start).to_rfc3339(),
            self.dimension_key
        )
    }
}

/// Converts epoch millis to a timestamp, clamping values chrono cannot represent
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}
