//! Sequence Execution Module
//!
//! Runs validated sequences: one thread per execution chain, barriers at
//! start and at Branch blocks, cooperative cancellation and backup
//! escalation.
//!
//! # Architecture
//!
//! - [`engine`]: Run control surface (load/start/interrupt/wait)
//! - [`runner`]: Chain scheduler and top-level runs with backups
//! - [`step`]: Per-block step dispatch
//! - [`stop`]: Cancellation controller tree and backup registry
//! - [`sync`]: Latches, join points and the time reference

pub mod engine;
pub mod runner;
pub mod step;
pub mod stop;
pub mod sync;

pub use engine::SequenceEngine;
pub use runner::{ChainState, RootRun, RunContext, RunReport, RunState, SequenceRun};
pub use stop::{BackupRegistry, ControllerState, StopController};
pub use sync::{Event, JoinPoint, TimeReference};
