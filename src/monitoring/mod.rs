//! Run Monitoring Module
//!
//! Provides the structured event stream emitted by sequence runs and
//! the sinks that consume it.
//!
//! # Components
//!
//! - [`LogSink`]: receiver of run events, injected into every run
//! - [`RunLogger`]: a sink scoped to one block of one sequence
//! - [`ExecutionTimeline`]: block state and timing tracker for reports

pub mod events;
pub mod timeline;

pub use events::{
    BlockState, FanoutSink, LogEvent, LogForwarder, LogSink, MemorySink, RunLogger, LOG_TARGET,
};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
