//! Sequence Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and planning sequence graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Block, Sequence)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Syntax and structural checks
//! - [`planner`]: Compilation into execution chains and join points

pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use model::{seconds, Block, BlockProperties, BlockType, Cardinality, Sequence, MAX_SECONDS};
pub use parser::{load_sequence, parse_sequence, save_sequence, LoadOptions, SequenceDocument};
pub use planner::{build_plan, ChainGate, ExecutionChain, ExecutionPlan, JoinPointSpec};
pub use validator::{quick_validate, validate_sequence};
