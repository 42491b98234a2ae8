//! Action Plugins Module
//!
//! Provides the lifecycle contract of pluggable actions, their typed
//! parameters, and the registry resolving Action blocks to plugins.
//!
//! # Structure
//!
//! - [`lifecycle`]: `Action` trait and the pre_run/run/post_run protocol
//! - [`params`]: Typed parameters, enumerations and casting rules
//! - [`registry`]: Name to plugin table
//! - [`builtin`]: `debug` and `custom` actions

pub mod builtin;
pub mod lifecycle;
pub mod params;
pub mod registry;

pub use lifecycle::{execute_action, Action, ActionContext, ActionError};
pub use params::{EnumValue, ParamError, ParamValue, ParameterSet};
pub use registry::{ActionDescriptor, ActionFactory, ActionRegistry};
