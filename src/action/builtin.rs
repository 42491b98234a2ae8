//! Built-in Actions
//!
//! - `debug`: logs a value on every run, and fails on demand
//! - `custom`: logs one of its parameters per run, showing every parameter
//!   type including an enumeration

use once_cell::sync::Lazy;

use super::lifecycle::{Action, ActionContext, ActionError};
use super::params::{parse_default_parameters, ParamError, ParamValue, ParameterSet};
use super::registry::ActionRegistry;
use crate::error::SequenceError;

const DEBUG_PARAMETERS: &str = "
log_value : debug_string : str
return_false : False : bool
";

const CUSTOM_PARAMETERS: &str = "
param_1 : default_string : str
param_2 : 3.141592653589 : float
param_3 : 42 : int
param_4 : small : small, big, HUGE
";

static DEBUG_DEFAULTS: Lazy<Result<ParameterSet, ParamError>> =
    Lazy::new(|| parse_default_parameters(DEBUG_PARAMETERS));

static CUSTOM_DEFAULTS: Lazy<Result<ParameterSet, ParamError>> =
    Lazy::new(|| parse_default_parameters(CUSTOM_PARAMETERS));

fn defaults(
    name: &str,
    parsed: &'static Lazy<Result<ParameterSet, ParamError>>,
) -> Result<ParameterSet, SequenceError> {
    Lazy::force(parsed).clone().map_err(|e| {
        SequenceError::action(format!(
            "Error while parsing parameters of action module '{}': {}",
            name, e
        ))
    })
}

/// Registers `debug` and `custom`.
pub fn register_builtins(registry: &mut ActionRegistry) -> Result<(), SequenceError> {
    registry.register("debug", defaults("debug", &DEBUG_DEFAULTS)?, |params| {
        Ok(Box::new(DebugAction::new(params)?) as Box<dyn Action>)
    });
    registry.register("custom", defaults("custom", &CUSTOM_DEFAULTS)?, |params| {
        Ok(Box::new(CustomAction::new(params)) as Box<dyn Action>)
    });
    Ok(())
}

/// Logs `log_value` on each run; `post_run` fails if `return_false` is set.
#[derive(Debug, Clone)]
pub struct DebugAction {
    log_value: String,
    return_false: bool,
}

impl DebugAction {
    pub fn new(params: &ParameterSet) -> Result<Self, ActionError> {
        Ok(Self {
            log_value: params
                .get_str("log_value")
                .ok_or_else(|| ActionError::MissingParameter("log_value".into()))?
                .to_string(),
            return_false: params
                .get_bool("return_false")
                .ok_or_else(|| ActionError::MissingParameter("return_false".into()))?,
        })
    }
}

impl Action for DebugAction {
    fn run(&mut self, ctx: &ActionContext) -> Result<bool, ActionError> {
        ctx.info(self.log_value.as_str());
        Ok(true)
    }

    fn post_run(&mut self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(!self.return_false)
    }
}

/// Logs `Parameter i = value` for the next parameter on each run.
#[derive(Debug, Clone)]
pub struct CustomAction {
    values: Vec<ParamValue>,
    cursor: usize,
}

impl CustomAction {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            values: params.iter().map(|(_, v)| v.clone()).collect(),
            cursor: 0,
        }
    }
}

impl Action for CustomAction {
    fn pre_run(&mut self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        self.cursor = 0;
        Ok(true)
    }

    fn run(&mut self, ctx: &ActionContext) -> Result<bool, ActionError> {
        let value = self
            .values
            .get(self.cursor)
            .ok_or_else(|| ActionError::failed("No parameter left to log"))?;
        ctx.info(format!("Parameter {} = {}", self.cursor, value));
        self.cursor += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::lifecycle::execute_action;
    use crate::execution::StopController;
    use crate::monitoring::{LogSink, MemorySink, RunLogger};
    use crate::sequence::Block;
    use std::sync::Arc;

    fn run(block: &Block) -> (bool, Arc<MemorySink>) {
        let registry = ActionRegistry::with_builtins();
        let (mut action, params) = registry.create(block).unwrap();
        let sink = Arc::new(MemorySink::new());
        let stop = StopController::new("main", 0, sink.clone());
        stop.arm();
        let logger = RunLogger::new(sink.clone() as Arc<dyn LogSink>, "main", 0, &block.id, "ACTION");
        let mut ctx = ActionContext::new(
            logger,
            params,
            block.properties.iteration(),
            block.properties.tick(),
            stop,
        );
        (execute_action(action.as_mut(), &mut ctx), sink)
    }

    #[test]
    fn test_defaults_parse() {
        let debug = DEBUG_DEFAULTS.as_ref().unwrap();
        assert_eq!(debug.get_str("log_value"), Some("debug_string"));
        assert_eq!(debug.get_bool("return_false"), Some(false));

        let custom = CUSTOM_DEFAULTS.as_ref().unwrap();
        assert_eq!(custom.len(), 4);
        assert_eq!(custom.get_str("param_4"), Some("small"));
    }

    #[test]
    fn test_debug_logs_value() {
        let block = Block::action("dbg", "debug")
            .with_iteration(2)
            .with_parameter("log_value", "hello");
        let (ok, sink) = run(&block);
        assert!(ok);
        let hellos = sink
            .messages_for("dbg")
            .into_iter()
            .filter(|m| m == "hello")
            .count();
        assert_eq!(hellos, 2);
    }

    #[test]
    fn test_debug_return_false() {
        let block = Block::action("dbg", "debug").with_parameter("return_false", "TRUE");
        let (ok, sink) = run(&block);
        assert!(!ok);
        assert!(sink.contains_message("PostRun returned False"));
    }

    #[test]
    fn test_custom_logs_each_parameter() {
        let block = Block::action("cst", "custom")
            .with_iteration(4)
            .with_parameter("param_4", "HUGE");
        let (ok, sink) = run(&block);
        assert!(ok);
        assert!(sink.contains_message("Parameter 0 = default_string"));
        assert!(sink.contains_message("Parameter 2 = 42"));
        assert!(sink.contains_message("Parameter 3 = HUGE"));
    }

    #[test]
    fn test_custom_runs_out_of_parameters() {
        let block = Block::action("cst", "custom").with_iteration(5);
        let (ok, sink) = run(&block);
        assert!(!ok);
        assert!(sink.contains_message("No parameter left to log"));
    }
}
