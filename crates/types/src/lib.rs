//! Core types and data models for the LLM telemetry pipeline
//!
//! This crate provides the data structures shared by the collector and the
//! stream aggregator: validated events, the versioned wire schema, the
//! rejection taxonomy, dead-letter records and aggregate rows.

pub mod aggregates;
pub mod dead_letter;
pub mod events;
pub mod schema;
pub mod validation;

pub use aggregates::AggregateRow;
pub use dead_letter::DeadLetterRecord;
pub use events::{DimensionKey, Event, EventMetrics, EventStatus, PartitionKey};
pub use schema::{RawEvent, RawEventV1, RawEventV2, SchemaError, CURRENT_SCHEMA_VERSION};
pub use validation::{EventField, KeyComponent, RejectionKind, RejectionReason};
