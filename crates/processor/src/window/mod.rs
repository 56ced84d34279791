//! Tumbling event-time windows
//!
//! Every event maps to exactly one window `[start, start + size)` where
//! `start` is the event time floored to a multiple of the window size.

pub mod assigner;
pub mod types;

pub use assigner::TumblingWindows;
pub use types::{millis_to_datetime, WindowBounds, WindowKey};
