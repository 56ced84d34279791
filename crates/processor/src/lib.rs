//! Windowed stream aggregation for LLM telemetry
//!
//! This crate consumes validated events from the partitioned log, folds them
//! into tumbling event-time windows keyed by model and model version, and
//! emits one finalized row per window and key to a sink. Offsets and window
//! state are committed atomically, so each event is counted exactly once even
//! across crashes and redelivery.

pub mod aggregation;
pub mod aggregator;
pub mod error;
pub mod sink;
pub mod state;
pub mod watermark;
pub mod window;

pub use aggregation::{Accumulator, LatencySketch, MetricDelta};
pub use aggregator::{AggregatorConfig, AggregatorStats, WindowAggregator};
pub use error::{
    ProcessorError, Result as ProcessorResult, SinkError, StateError, Transient, WindowError,
};
pub use sink::{AggregateSink, JsonLinesSink, MemorySink, UpsertOutcome};
pub use state::{
    AggregationStateStore, ClosedWindow, CommitOutcome, FoldBatch, MemoryStateStore,
    OffsetCursor, OpenWindow, SledConfig, SledStateStore, VerifyReport, WindowClosure,
};
pub use watermark::{Watermark, WatermarkConfig, WatermarkTracker};
pub use window::{TumblingWindows, WindowBounds, WindowKey};
