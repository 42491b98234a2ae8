//! Action Lifecycle
//!
//! The contract every pluggable action satisfies, and the protocol the
//! scheduler drives it through:
//!
//! 1. `pre_run` once (skipped if a stop was already requested)
//! 2. `run` once per iteration, with a tick delay between iterations
//! 3. `post_run` always, whose result is the outcome of the action
//!
//! Errors and panics raised by an action are caught, logged and count as a
//! failure of the method that raised them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;

use super::params::ParameterSet;
use crate::execution::StopController;
use crate::monitoring::RunLogger;
use crate::sequence::seconds;

/// Error raised by an action method.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("Missing parameter '{0}'")]
    MissingParameter(String),
}

impl ActionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A unit of work bound to an Action block.
///
/// Every method has a default: `pre_run` and `run` succeed, and `post_run`
/// succeeds if every configured iteration succeeded.
pub trait Action: Send {
    fn pre_run(&mut self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(true)
    }

    fn run(&mut self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(true)
    }

    fn post_run(&mut self, ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(ctx.all_ok())
    }
}

/// What an action sees of its execution: parameters, progress, logging and
/// the stop signal.
#[derive(Debug)]
pub struct ActionContext {
    logger: RunLogger,
    parameters: ParameterSet,
    iteration: u32,
    tick: Duration,
    current_iteration: u32,
    valid_run_count: u32,
    pre_run_ok: bool,
    stop: StopController,
}

impl ActionContext {
    pub fn new(
        logger: RunLogger,
        parameters: ParameterSet,
        iteration: u32,
        tick: f64,
        stop: StopController,
    ) -> Self {
        Self {
            logger,
            parameters,
            iteration,
            tick: seconds(tick),
            current_iteration: 0,
            valid_run_count: 0,
            pre_run_ok: false,
            stop,
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn block_id(&self) -> &str {
        self.logger.block_id()
    }

    /// Configured number of iterations.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// 1-based index of the iteration in progress (0 outside `run`).
    pub fn current_iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn valid_run_count(&self) -> u32 {
        self.valid_run_count
    }

    /// True if every configured iteration succeeded.
    pub fn all_ok(&self) -> bool {
        self.valid_run_count == self.iteration
    }

    pub fn pre_run_ok(&self) -> bool {
        self.pre_run_ok
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.logger.debug(msg);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.logger.info(msg);
    }

    pub fn warning(&self, msg: impl Into<String>) {
        self.logger.warning(msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.logger.error(msg);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Calls one action method, turning errors and panics into `None`.
fn guarded<F>(ctx: &ActionContext, failure: &str, call: F) -> Option<bool>
where
    F: FnOnce() -> Result<bool, ActionError>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            ctx.error(format!("{}:", failure));
            ctx.error(e.to_string());
            None
        }
        Err(payload) => {
            ctx.error(format!("{}:", failure));
            ctx.error(panic_message(payload));
            None
        }
    }
}

/// Drives an action through its lifecycle and returns its outcome.
pub fn execute_action(action: &mut dyn Action, ctx: &mut ActionContext) -> bool {
    if ctx.is_stopped() {
        ctx.warning("The stop mechanism has been activated before PreRun");
    } else {
        ctx.info("PreRun");
        ctx.pre_run_ok = guarded(ctx, "PreRun failed", || action.pre_run(ctx)) == Some(true);

        if !ctx.pre_run_ok {
            ctx.warning("PreRun returned False");
        } else if ctx.is_stopped() {
            ctx.warning("The stop mechanism has been activated during PreRun");
        } else {
            run_iterations(action, ctx);
        }
    }

    ctx.current_iteration = 0;
    ctx.info("PostRun");
    match guarded(ctx, "PostRun failed", || action.post_run(ctx)) {
        Some(true) => true,
        Some(false) => {
            ctx.warning("PostRun returned False");
            false
        }
        None => false,
    }
}

fn run_iterations(action: &mut dyn Action, ctx: &mut ActionContext) {
    let total = ctx.iteration;
    if total == 1 {
        ctx.info("Run");
    } else {
        ctx.info(format!("Run ({} iterations)", total));
    }

    for i in 1..=total {
        ctx.current_iteration = i;
        let failure = format!("Run failed on execution {}", i);
        match guarded(ctx, &failure, || action.run(ctx)) {
            Some(true) => ctx.valid_run_count += 1,
            Some(false) => {
                ctx.warning(format!("Run returned False on execution {}", i));
                break;
            }
            None => break,
        }

        if i == total {
            break;
        }
        if ctx.is_stopped() {
            ctx.warning(format!(
                "The stop mechanism has been activated during Run (execution {})",
                i
            ));
            break;
        }
        if !ctx.stop.sleep(ctx.tick) {
            ctx.warning(format!(
                "The stop mechanism has been activated during Run (tick {})",
                i
            ));
            break;
        }
    }
}
