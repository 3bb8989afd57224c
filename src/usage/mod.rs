//! Usage Telemetry
//!
//! Durable append-only event log (newline-delimited JSON) plus in-process
//! aggregate counters. Production completions and synthetic dev-harness
//! completions flow through the same recording path, so both carry
//! identical telemetry semantics.

pub mod events;
pub mod recorder;

pub use events::{DecisionEvent, UsageEvent};
pub use recorder::{AggregateSnapshot, UsageRecorder};
