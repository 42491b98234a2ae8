//! Sequence Scheduler
//!
//! Runs the execution plan of a sequence with one thread per chain.
//!
//! All chains of a run wait on a shared start barrier; chains forked at a
//! Branch block wait on that block's release barrier instead. A chain that
//! fails requests a stop so its siblings end at their next checkpoint, and
//! registers the backup of its sequence.
//!
//! [`RootRun`] wraps a top-level run and escalates the registered backups
//! once it finished, deepest level first.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::step::execute_step;
use super::stop::StopController;
use super::sync::{Event, JoinPoint, TimeReference};
use crate::action::ActionRegistry;
use crate::error::SequenceError;
use crate::monitoring::{LogSink, RunLogger};
use crate::sequence::{build_plan, Block, ChainGate, ExecutionChain, ExecutionPlan, Sequence};

/// Services shared by every run of an engine.
#[derive(Clone)]
pub struct RunContext {
    pub registry: Arc<ActionRegistry>,
    pub sink: Arc<dyn LogSink>,
}

impl RunContext {
    pub fn new(registry: Arc<ActionRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self { registry, sink }
    }
}

/// Lifecycle of one execution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    WaitingForStart,
    Executing,
    Completed,
    Failed,
    Aborted,
}

/// One execution of a sequence graph.
pub struct SequenceRun {
    sequence: Arc<Sequence>,
    plan: ExecutionPlan,
    controller: StopController,
    context: RunContext,
    starter: Event,
    time_ref: TimeReference,
    joins: BTreeMap<usize, Arc<JoinPoint>>,
    states: Mutex<Vec<ChainState>>,
}

impl SequenceRun {
    /// Plans a run of `sequence` under `controller`.
    ///
    /// Every barrier of the run is registered with the controller so that a
    /// stop request opens it.
    pub fn new(
        sequence: Arc<Sequence>,
        controller: StopController,
        context: RunContext,
    ) -> Result<Self, SequenceError> {
        let plan = build_plan(&sequence)?;

        let starter = Event::new();
        controller.add_starter(starter.clone());

        let joins: BTreeMap<usize, Arc<JoinPoint>> = plan
            .join_points
            .values()
            .map(|point| (point.block, Arc::new(JoinPoint::new(point.expected))))
            .collect();
        for join in joins.values() {
            controller.add_starter(join.completion_event().clone());
            controller.add_starter(join.release_event().clone());
        }

        debug!(
            "Sequence '{}' planned: {} chain(s), {} join point(s), {} step(s)",
            sequence.id,
            plan.chains.len(),
            joins.len(),
            plan.step_count()
        );

        let states = Mutex::new(vec![ChainState::WaitingForStart; plan.chains.len()]);
        Ok(Self {
            sequence,
            plan,
            controller,
            context,
            starter,
            time_ref: TimeReference::new(),
            joins,
            states,
        })
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn controller(&self) -> &StopController {
        &self.controller
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn time_reference(&self) -> &TimeReference {
        &self.time_ref
    }

    pub(crate) fn join_point(&self, block: usize) -> Option<&Arc<JoinPoint>> {
        self.joins.get(&block)
    }

    pub(crate) fn logger_for(&self, block: &Block) -> RunLogger {
        RunLogger::new(
            Arc::clone(&self.context.sink),
            self.sequence.id.as_str(),
            self.sequence.level,
            block.id.as_str(),
            block.block_type.tag(),
        )
    }

    /// Current state of every chain, by chain index.
    pub fn chain_states(&self) -> Vec<ChainState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, chain: usize, state: ChainState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = states.get_mut(chain) {
            *slot = state;
        }
    }

    /// Runs every chain and returns true if every terminal chain completed.
    pub fn run(&self) -> bool {
        info!("Running sequence '{}' (level {})", self.sequence.id, self.sequence.level);

        let outcomes: Vec<ChainState> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.plan.chains.len());
            for chain in &self.plan.chains {
                let spawned = thread::Builder::new()
                    .name(format!("{}#{}", self.sequence.id, chain.index))
                    .spawn_scoped(scope, move || self.run_chain(chain));
                match spawned {
                    Ok(handle) => handles.push((chain.index, Some(handle))),
                    Err(e) => {
                        error!("Failed to start chain {} of '{}': {}", chain.index, self.sequence.id, e);
                        self.controller.request_stop();
                        handles.push((chain.index, None));
                    }
                }
            }

            self.time_ref.reset();
            self.starter.set();

            handles
                .into_iter()
                .map(|(index, handle)| {
                    let state = match handle.map(|h| h.join()) {
                        Some(Ok(state)) => state,
                        Some(Err(_)) => {
                            error!("Chain {} of '{}' panicked", index, self.sequence.id);
                            ChainState::Failed
                        }
                        None => ChainState::Failed,
                    };
                    self.set_state(index, state);
                    state
                })
                .collect()
        });

        let mut terminal = self
            .plan
            .chains
            .iter()
            .filter(|c| c.terminal)
            .map(|c| outcomes.get(c.index).copied().unwrap_or(ChainState::Failed))
            .peekable();
        let success = terminal.peek().is_some() && terminal.all(|s| s == ChainState::Completed);

        if success {
            info!("Sequence '{}' succeeded", self.sequence.id);
        } else {
            warn!("Sequence '{}' failed", self.sequence.id);
        }
        success
    }

    fn gate_of(&self, chain: &ExecutionChain) -> Option<&Event> {
        match chain.gate {
            ChainGate::SequenceStart => Some(&self.starter),
            ChainGate::JoinRelease(block) => self.joins.get(&block).map(|j| j.release_event()),
        }
    }

    fn run_chain(&self, chain: &ExecutionChain) -> ChainState {
        let state = match self.gate_of(chain) {
            Some(gate) => {
                gate.wait();
                match panic::catch_unwind(AssertUnwindSafe(|| self.execute_chain(chain))) {
                    Ok(state) => state,
                    Err(_) => {
                        error!("Chain {} of '{}' panicked", chain.index, self.sequence.id);
                        self.fail();
                        ChainState::Failed
                    }
                }
            }
            None => {
                error!("Chain {} of '{}' has no gate", chain.index, self.sequence.id);
                self.fail();
                ChainState::Failed
            }
        };

        if let Some(join) = chain.join_target.and_then(|b| self.joins.get(&b)) {
            join.arrive();
        }
        debug!("Chain {} of '{}' ended: {:?}", chain.index, self.sequence.id, state);
        state
    }

    fn execute_chain(&self, chain: &ExecutionChain) -> ChainState {
        if self.controller.is_stopped() {
            self.set_state(chain.index, ChainState::Aborted);
            return ChainState::Aborted;
        }
        self.set_state(chain.index, ChainState::Executing);

        for &step in &chain.steps {
            if self.controller.is_stopped() {
                self.fail();
                return ChainState::Failed;
            }
            if !execute_step(self, step) {
                self.fail();
                return ChainState::Failed;
            }
        }
        ChainState::Completed
    }

    fn fail(&self) {
        self.controller.request_stop();
        self.controller
            .register_backup_candidate(self.sequence.backup.as_ref());
    }
}

/// Overall state of a top-level run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Loaded,
    Armed,
    Running,
    Finished,
    FinishedWithBackup,
}

/// Outcome of a top-level run and of the backups it escalated.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub sequence_id: String,
    pub success: bool,
    pub state: RunState,
    pub backups: Vec<RunReport>,
    pub duration_ms: u128,
}

impl RunReport {
    /// Total number of backup runs, nested ones included.
    pub fn backup_count(&self) -> usize {
        self.backups.iter().map(|b| 1 + b.backup_count()).sum()
    }
}

/// A top-level run followed by the escalation of its backups.
pub struct RootRun {
    sequence: Arc<Sequence>,
    controller: StopController,
    context: RunContext,
    state: Mutex<RunState>,
}

impl RootRun {
    pub fn new(sequence: Arc<Sequence>, context: RunContext) -> Self {
        let controller = StopController::new(
            sequence.id.as_str(),
            sequence.level,
            Arc::clone(&context.sink),
        );
        Self::with_controller(sequence, controller, context)
    }

    pub fn with_controller(
        sequence: Arc<Sequence>,
        controller: StopController,
        context: RunContext,
    ) -> Self {
        Self {
            sequence,
            controller,
            context,
            state: Mutex::new(RunState::Loaded),
        }
    }

    pub fn controller(&self) -> &StopController {
        &self.controller
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Requests the run (or the backup in progress) to stop.
    pub fn stop(&self) {
        self.controller.request_stop();
    }

    pub fn run(&self) -> RunReport {
        let start = Instant::now();

        self.set_state(RunState::Armed);
        self.controller.arm();

        let success = match SequenceRun::new(
            Arc::clone(&self.sequence),
            self.controller.clone(),
            self.context.clone(),
        ) {
            Ok(run) => {
                self.set_state(RunState::Running);
                run.run()
            }
            Err(e) => {
                error!("Sequence '{}' could not be planned: {}", self.sequence.id, e);
                false
            }
        };
        self.controller.disarm();

        let mut backups = Vec::new();
        for backup in self.controller.backups().drain_ordered() {
            info!(
                "Running backup '{}' (level {}, depth {})",
                backup.id, backup.level, backup.depth
            );
            let child = self
                .controller
                .nested_root(backup.id.as_str(), backup.level);
            let report =
                RootRun::with_controller(backup, child.clone(), self.context.clone()).run();
            self.controller.unregister_child(&child);
            backups.push(report);
        }

        let state = if backups.is_empty() {
            RunState::Finished
        } else {
            RunState::FinishedWithBackup
        };
        self.set_state(state);

        RunReport {
            sequence_id: self.sequence.id.clone(),
            success,
            state,
            backups,
            duration_ms: start.elapsed().as_millis(),
        }
    }
}
