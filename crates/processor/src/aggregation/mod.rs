//! Window aggregation primitives
//!
//! [`Accumulator`] holds the running totals for one window and dimension key;
//! [`LatencySketch`] backs its latency percentiles.

mod accumulator;
mod sketch;

pub use accumulator::{event_fingerprint, Accumulator, MetricDelta};
pub use sketch::{LatencySketch, DEFAULT_RELATIVE_ACCURACY};
