//! Queue back-pressure monitoring
//!
//! The publish queue is a bounded channel, so overflow is never buffered:
//! a full queue turns into `Throttled` for the submitter. This module tracks
//! how full the queue is and logs every level transition.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// Queue utilization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLevel {
    /// Queue usage is normal
    Normal,
    /// Warning threshold exceeded
    Warning,
    /// Critical threshold exceeded
    Critical,
    /// Queue is full; submits are throttled
    Full,
}

impl BufferLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Full => "full",
        }
    }
}

/// Queue monitor configuration
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub capacity: usize,
    /// Threshold for warning (percentage, 0-100)
    pub warning_threshold_percent: u8,
    /// Threshold for critical state (percentage, 0-100)
    pub critical_threshold_percent: u8,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
        }
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub queue_len: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    pub level: BufferLevel,
}

pub struct QueueMonitor {
    config: BackpressureConfig,
    current: AtomicUsize,
}

impl QueueMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        info!(
            capacity = config.capacity,
            warning = config.warning_threshold_percent,
            critical = config.critical_threshold_percent,
            "Creating queue monitor"
        );
        Self {
            config,
            current: AtomicUsize::new(0),
        }
    }

    /// Level for a given queue length
    pub fn level_for(&self, len: usize) -> BufferLevel {
        let capacity = self.config.capacity.max(1);
        let utilization = (len as f64 / capacity as f64) * 100.0;

        if len >= capacity {
            BufferLevel::Full
        } else if utilization >= f64::from(self.config.critical_threshold_percent) {
            BufferLevel::Critical
        } else if utilization >= f64::from(self.config.warning_threshold_percent) {
            BufferLevel::Warning
        } else {
            BufferLevel::Normal
        }
    }

    /// Record one job entering the queue; returns the new length
    pub fn enqueued(&self) -> usize {
        let len = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.log_transition(len - 1, len);
        len
    }

    /// Record one job leaving the queue; returns the new length
    pub fn dequeued(&self) -> usize {
        let previous = match self.current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        }) {
            Ok(previous) | Err(previous) => previous,
        };
        let len = previous.saturating_sub(1);
        self.log_transition(previous, len);
        len
    }

    fn log_transition(&self, previous: usize, len: usize) {
        let old_level = self.level_for(previous);
        let new_level = self.level_for(len);
        if old_level == new_level {
            return;
        }

        let capacity = self.config.capacity;
        match new_level {
            BufferLevel::Normal => info!(len, capacity, "Queue level: normal"),
            BufferLevel::Warning => warn!(len, capacity, "Queue level: warning"),
            BufferLevel::Critical => error!(len, capacity, "Queue level: critical"),
            BufferLevel::Full => error!(len, capacity, "Queue level: full, throttling submits"),
        }
    }

    pub fn stats(&self) -> BackpressureStats {
        // a rejected send is counted for an instant before it is undone
        let len = self.current.load(Ordering::Relaxed).min(self.config.capacity);
        BackpressureStats {
            queue_len: len,
            capacity: self.config.capacity,
            utilization_percent: (len as f64 / self.config.capacity.max(1) as f64) * 100.0,
            level: self.level_for(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> QueueMonitor {
        QueueMonitor::new(BackpressureConfig {
            capacity: 100,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
        })
    }

    #[test]
    fn test_levels() {
        let m = monitor();
        assert_eq!(m.level_for(0), BufferLevel::Normal);
        assert_eq!(m.level_for(79), BufferLevel::Normal);
        assert_eq!(m.level_for(80), BufferLevel::Warning);
        assert_eq!(m.level_for(95), BufferLevel::Critical);
        assert_eq!(m.level_for(100), BufferLevel::Full);
    }

    #[test]
    fn test_enqueued_updates_stats() {
        let m = monitor();
        for _ in 0..90 {
            m.enqueued();
        }
        let stats = m.stats();
        assert_eq!(stats.queue_len, 90);
        assert_eq!(stats.level, BufferLevel::Warning);
        assert!((stats.utilization_percent - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_enqueue_and_dequeue_move_level_both_ways() {
        let m = monitor();
        for _ in 0..100 {
            m.enqueued();
        }
        assert_eq!(m.stats().level, BufferLevel::Full);

        for _ in 0..30 {
            m.dequeued();
        }
        assert_eq!(m.stats().queue_len, 70);
        assert_eq!(m.stats().level, BufferLevel::Normal);

        // never underflows
        for _ in 0..80 {
            m.dequeued();
        }
        assert_eq!(m.stats().queue_len, 0);
    }
}
