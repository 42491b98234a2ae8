//! SeqRunner - Concurrent Sequence Execution Engine
//!
//! Runs sequences: directed graphs of typed blocks (actions, waits, branch
//! points, nested subsequence calls) executed as parallel chains with
//! cooperative cancellation and backup escalation on failure.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`sequence`]: Sequence graphs, YAML loading, validation and planning
//! - [`execution`]: Chain scheduler, cancellation and the run control surface
//! - [`action`]: Pluggable actions, their parameters and lifecycle
//! - [`monitoring`]: Structured run events and the execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seqrunner::{ActionRegistry, LoadOptions, LogForwarder, SequenceEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = SequenceEngine::new(
//!         Arc::new(ActionRegistry::with_builtins()),
//!         Arc::new(LogForwarder),
//!     );
//!
//!     // Load and validate a sequence
//!     engine.load_file("sequence.yaml", &LoadOptions::default().with_max_depth(2))?;
//!
//!     // Execute it
//!     engine.start()?;
//!     engine.wait(None);
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod sequence;

// Re-export commonly used types
pub use action::{Action, ActionContext, ActionError, ActionRegistry};
pub use error::{EngineError, SequenceError};
pub use execution::{RunReport, SequenceEngine, StopController};
pub use monitoring::{ExecutionTimeline, LogEvent, LogForwarder, LogSink};
pub use sequence::{load_sequence, Block, BlockType, LoadOptions, Sequence};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "SeqRunner";
