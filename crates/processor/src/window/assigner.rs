//! Tumbling window assignment

use super::types::{WindowBounds, WindowKey};
use crate::error::WindowError;
use llm_telemetry_types::Event;
use std::time::Duration;

/// Fixed-size, non-overlapping windows aligned to the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
}

impl TumblingWindows {
    pub fn new(size: Duration) -> Result<Self, WindowError> {
        let size_ms = i64::try_from(size.as_millis()).unwrap_or(i64::MAX);
        if size_ms <= 0 {
            return Err(WindowError::InvalidWindowSize {
                size: size.as_millis() as u64,
            });
        }
        Ok(Self { size_ms })
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `timestamp`, rounding toward negative infinity
    pub fn window_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.size_ms) * self.size_ms
    }

    pub fn window_end(&self, window_start: i64) -> i64 {
        window_start.saturating_add(self.size_ms)
    }

    pub fn bounds(&self, timestamp: i64) -> WindowBounds {
        let start = self.window_start(timestamp);
        WindowBounds::new(start, self.window_end(start))
    }

    pub fn key_for(&self, event: &Event) -> WindowKey {
        WindowKey::new(
            self.window_start(event.event_time_millis()),
            event.dimension_key().clone(),
        )
    }
}
