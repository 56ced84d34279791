//! Per-partition event-time watermarks
//!
//! A partition's watermark is the largest event time observed on it minus the
//! allowed lateness. Watermarks never move backwards. A window may close once
//! every partition of the log has a watermark at or past the window end, since
//! any partition may still hold events for it.
//!
//! Partitions that go quiet would otherwise hold back every window. When a
//! partition has seen no events for longer than the idle timeout, its
//! watermark is extrapolated forward by the wall-clock time elapsed since its
//! last event. A registered partition that has never seen an event is raised
//! to the slowest watermark among the partitions that have, once it has been
//! silent for the idle timeout.
//!
//! # Example
//!
//! ```rust
//! use processor::watermark::{WatermarkConfig, WatermarkTracker};
//! use std::time::Duration;
//!
//! let tracker = WatermarkTracker::new(WatermarkConfig {
//!     allowed_lateness: Duration::from_secs(10),
//!     idle_timeout: None,
//! });
//!
//! let watermark = tracker.observe(0, 60_000);
//! assert_eq!(watermark.timestamp, 50_000);
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Event-time progress marker, in milliseconds since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: i64,
}

impl Watermark {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Returns `None` for the sentinel watermarks outside chrono's range
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Watermark of a partition that has seen nothing
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    pub fn max() -> Self {
        Self { timestamp: i64::MAX }
    }

    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Whether everything ending at or before `window_end` is complete
    pub fn has_passed(&self, window_end: i64) -> bool {
        self.timestamp >= window_end
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            return write!(f, "Watermark(min)");
        }
        match self.to_datetime() {
            Some(dt) => write!(f, "Watermark({})", dt.to_rfc3339()),
            None => write!(f, "Watermark({}ms)", self.timestamp),
        }
    }
}

/// Watermark tracker configuration
#[derive(Debug, Clone)]
pub struct WatermarkConfig {
    /// How far behind the newest event a watermark trails
    pub allowed_lateness: Duration,
    /// Silence after which a partition's watermark advances with wall time
    pub idle_timeout: Option<Duration>,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            allowed_lateness: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
struct PartitionClock {
    max_event_time: Option<i64>,
    watermark: Watermark,
    last_event_at: Instant,
}

impl PartitionClock {
    fn empty(now: Instant) -> Self {
        Self {
            max_event_time: None,
            watermark: Watermark::min(),
            last_event_at: now,
        }
    }
}

/// Tracks watermarks for every partition of the log
///
/// Shared between partition workers; each worker only advances its own
/// partition but reads the others when deciding whether a window can close.
#[derive(Debug)]
pub struct WatermarkTracker {
    lateness_ms: i64,
    idle_timeout: Option<Duration>,
    partitions: DashMap<u32, PartitionClock>,
}

impl WatermarkTracker {
    pub fn new(config: WatermarkConfig) -> Self {
        Self {
            lateness_ms: duration_millis(config.allowed_lateness),
            idle_timeout: config.idle_timeout,
            partitions: DashMap::new(),
        }
    }

    /// Starts tracking partitions that have not produced events yet
    ///
    /// Their idle time counts from `now`.
    pub fn register<I>(&self, partitions: I, now: Instant)
    where
        I: IntoIterator<Item = u32>,
    {
        for partition in partitions {
            self.partitions
                .entry(partition)
                .or_insert_with(|| PartitionClock::empty(now));
        }
    }

    /// Records an event time for a partition and returns its watermark
    pub fn observe(&self, partition: u32, event_time: i64) -> Watermark {
        self.observe_at(partition, event_time, Instant::now())
    }

    /// Same as [`observe`](Self::observe) with an explicit wall-clock instant
    pub fn observe_at(&self, partition: u32, event_time: i64, now: Instant) -> Watermark {
        let candidate = Watermark::new(event_time.saturating_sub(self.lateness_ms));
        let mut clock = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionClock::empty(now));

        clock.last_event_at = now;
        clock.max_event_time = Some(
            clock
                .max_event_time
                .map_or(event_time, |max| max.max(event_time)),
        );
        if candidate > clock.watermark {
            trace!(partition, watermark = %candidate, "Watermark advanced");
            clock.watermark = candidate;
        }
        clock.watermark
    }

    /// Seeds a partition from a persisted cursor after restart
    pub fn restore(&self, partition: u32, max_event_time: i64) {
        let watermark = self.observe_at(partition, max_event_time, Instant::now());
        debug!(partition, %watermark, "Restored partition watermark");
    }

    /// Current watermark of a partition, `Watermark::min()` if unseen
    pub fn watermark(&self, partition: u32) -> Watermark {
        self.partitions
            .get(&partition)
            .map(|clock| clock.watermark)
            .unwrap_or_default()
    }

    /// Largest event time observed on a partition
    pub fn max_event_time(&self, partition: u32) -> Option<i64> {
        self.partitions
            .get(&partition)
            .and_then(|clock| clock.max_event_time)
    }

    /// Smallest watermark across the given partitions
    ///
    /// An empty set yields `Watermark::min()` so nothing closes by accident.
    pub fn min_watermark<I>(&self, partitions: I) -> Watermark
    where
        I: IntoIterator<Item = u32>,
    {
        partitions
            .into_iter()
            .map(|p| self.watermark(p))
            .min()
            .unwrap_or_default()
    }

    /// Advances idle partitions by the wall time since their last event
    ///
    /// Returns the partitions whose watermark moved.
    pub fn advance_idle(&self, now: Instant) -> Vec<(u32, Watermark)> {
        let Some(idle_timeout) = self.idle_timeout else {
            return Vec::new();
        };

        let mut advanced = Vec::new();
        for mut entry in self.partitions.iter_mut() {
            let partition = *entry.key();
            let clock = entry.value_mut();
            let silent_for = now.saturating_duration_since(clock.last_event_at);
            let Some(max_event_time) = clock.max_event_time else {
                continue;
            };
            if silent_for <= idle_timeout {
                continue;
            }

            let candidate = Watermark::new(
                max_event_time
                    .saturating_sub(self.lateness_ms)
                    .saturating_add(duration_millis(silent_for)),
            );
            if candidate > clock.watermark {
                debug!(
                    partition,
                    watermark = %candidate,
                    silent_ms = duration_millis(silent_for),
                    "Idle partition watermark advanced"
                );
                clock.watermark = candidate;
                advanced.push((partition, candidate));
            }
        }

        // partitions with no events follow the slowest partition that has some
        let floor = self
            .partitions
            .iter()
            .filter(|entry| entry.max_event_time.is_some())
            .map(|entry| entry.watermark)
            .min();
        let Some(floor) = floor else {
            return advanced;
        };
        for mut entry in self.partitions.iter_mut() {
            let partition = *entry.key();
            let clock = entry.value_mut();
            if clock.max_event_time.is_some()
                || now.saturating_duration_since(clock.last_event_at) <= idle_timeout
            {
                continue;
            }
            if floor > clock.watermark {
                debug!(partition, watermark = %floor, "Empty partition watermark advanced");
                clock.watermark = floor;
                advanced.push((partition, floor));
            }
        }
        advanced.sort_unstable_by_key(|(partition, _)| *partition);
        advanced
    }

    pub fn partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.partitions.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tracker(lateness_secs: u64, idle_secs: Option<u64>) -> WatermarkTracker {
        WatermarkTracker::new(WatermarkConfig {
            allowed_lateness: Duration::from_secs(lateness_secs),
            idle_timeout: idle_secs.map(Duration::from_secs),
        })
    }

    #[test]
    fn test_watermark_trails_max_event_time() {
        let tracker = tracker(10, None);
        assert_eq!(tracker.observe(0, 60_000), Watermark::new(50_000));
        assert_eq!(tracker.observe(0, 55_000), Watermark::new(50_000));
        assert_eq!(tracker.observe(0, 70_000), Watermark::new(60_000));
        assert_eq!(tracker.max_event_time(0), Some(70_000));
    }

    #[test]
    fn test_unseen_partition_is_min() {
        let tracker = tracker(10, None);
        assert!(tracker.watermark(3).is_min());
        assert!(tracker.min_watermark(Vec::new()).is_min());
    }

    #[test]
    fn test_min_across_partitions() {
        let tracker = tracker(0, None);
        tracker.observe(0, 100);
        tracker.observe(1, 40);
        tracker.observe(2, 300);
        assert_eq!(tracker.min_watermark([0, 1, 2]), Watermark::new(40));
        assert_eq!(tracker.min_watermark([0, 2]), Watermark::new(100));
        assert!(tracker.min_watermark([0, 7]).is_min());
    }

    #[test]
    fn test_monotonic_under_random_arrivals() {
        let tracker = tracker(5, None);
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = [Watermark::min(); 4];

        for _ in 0..5_000 {
            let partition = rng.gen_range(0..4u32);
            let event_time = rng.gen_range(0..1_000_000i64);
            let watermark = tracker.observe(partition, event_time);
            assert!(watermark >= previous[partition as usize]);
            previous[partition as usize] = watermark;
        }
    }

    #[test]
    fn test_idle_partition_advances_with_wall_time() {
        let tracker = tracker(10, Some(30));
        let start = Instant::now();
        tracker.observe_at(0, 100_000, start);

        // not idle yet
        assert!(tracker.advance_idle(start + Duration::from_secs(20)).is_empty());
        assert_eq!(tracker.watermark(0), Watermark::new(90_000));

        let advanced = tracker.advance_idle(start + Duration::from_secs(45));
        assert_eq!(advanced, vec![(0, Watermark::new(135_000))]);

        // a late straggler does not pull the watermark back
        let watermark = tracker.observe_at(0, 101_000, start + Duration::from_secs(46));
        assert_eq!(watermark, Watermark::new(135_000));
    }

    #[test]
    fn test_registered_empty_partition_holds_back_until_idle() {
        let tracker = tracker(10, Some(30));
        let start = Instant::now();
        tracker.register(0..2, start);
        assert!(tracker.watermark(1).is_min());
        assert_eq!(tracker.max_event_time(1), None);

        tracker.observe_at(0, 100_000, start);
        tracker.observe_at(0, 130_000, start + Duration::from_secs(40));
        assert!(tracker.min_watermark(0..2).is_min());

        // partition 0 is not idle, so partition 1 only catches up to it
        let advanced = tracker.advance_idle(start + Duration::from_secs(45));
        assert_eq!(advanced, vec![(1, Watermark::new(120_000))]);
        assert_eq!(tracker.min_watermark(0..2), Watermark::new(120_000));

        // registering again leaves existing clocks alone
        tracker.register(0..2, start + Duration::from_secs(50));
        assert_eq!(tracker.watermark(1), Watermark::new(120_000));

        // real events still move it forward
        assert_eq!(
            tracker.observe_at(1, 200_000, start + Duration::from_secs(51)),
            Watermark::new(190_000)
        );
    }

    #[test]
    fn test_empty_partition_without_idle_timeout_stays_min() {
        let tracker = tracker(10, None);
        let start = Instant::now();
        tracker.register([0, 1], start);
        tracker.observe_at(0, 100_000, start);
        assert!(tracker.advance_idle(start + Duration::from_secs(3600)).is_empty());
        assert!(tracker.min_watermark([0, 1]).is_min());
    }

    #[test]
    fn test_idle_disabled() {
        let tracker = tracker(10, None);
        let start = Instant::now();
        tracker.observe_at(0, 100_000, start);
        assert!(tracker.advance_idle(start + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_restore_never_regresses() {
        let tracker = tracker(10, None);
        tracker.observe(1, 500_000);
        tracker.restore(1, 200_000);
        assert_eq!(tracker.watermark(1), Watermark::new(490_000));
        tracker.restore(2, 200_000);
        assert_eq!(tracker.watermark(2), Watermark::new(190_000));
        assert_eq!(tracker.partitions(), vec![1, 2]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Watermark::min().to_string(), "Watermark(min)");
        assert_eq!(
            Watermark::new(0).to_string(),
            "Watermark(1970-01-01T00:00:00+00:00)"
        );
    }
}
