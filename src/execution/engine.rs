//! Sequence Execution Engine
//!
//! The run control surface offered to external tooling (CLI, GUI):
//! - `load` a validated sequence
//! - `start` it on a background thread
//! - `interrupt` the run in progress
//! - `wait` for it to finish
//!
//! A run always ends with a [`RunReport`], including the backups it
//! escalated.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use super::runner::{RootRun, RunContext, RunReport};
use super::stop::StopController;
use super::sync::Event;
use crate::action::ActionRegistry;
use crate::error::EngineError;
use crate::monitoring::LogSink;
use crate::sequence::{load_sequence, validate_sequence, LoadOptions, Sequence};

struct ActiveRun {
    controller: StopController,
    finished: Event,
    handle: JoinHandle<RunReport>,
}

/// Sequence execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use seqrunner::action::ActionRegistry;
/// use seqrunner::execution::SequenceEngine;
/// use seqrunner::monitoring::LogForwarder;
/// use seqrunner::sequence::LoadOptions;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = SequenceEngine::new(
///         Arc::new(ActionRegistry::with_builtins()),
///         Arc::new(LogForwarder),
///     );
///     engine.load_file("sequence.yaml", &LoadOptions::default())?;
///     engine.start()?;
///     engine.wait(None);
///     Ok(())
/// }
/// ```
pub struct SequenceEngine {
    context: RunContext,
    sequence: Option<Arc<Sequence>>,
    active: Option<ActiveRun>,
    interrupted: bool,
    last_report: Option<RunReport>,
}

impl SequenceEngine {
    /// Creates an engine resolving actions through `registry` and
    /// reporting run events to `sink`.
    pub fn new(registry: Arc<ActionRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            context: RunContext::new(registry, sink),
            sequence: None,
            active: None,
            interrupted: false,
            last_report: None,
        }
    }

    /// Validates and loads a sequence, replacing the loaded one.
    ///
    /// Refused while a run is in progress, unless it was interrupted, in
    /// which case the run is awaited first.
    pub fn load(&mut self, sequence: Sequence) -> Result<(), EngineError> {
        if self.is_running() {
            if !self.interrupted {
                return Err(EngineError::Busy);
            }
            self.wait(None);
        }
        self.finish();

        validate_sequence(&sequence)?;
        self.context.registry.check_sequence(&sequence)?;

        info!(
            "Sequence '{}' loaded ({} blocks, {} subsequences)",
            sequence.id,
            sequence.len(),
            sequence.subsequences.len()
        );
        self.sequence = Some(Arc::new(sequence));
        Ok(())
    }

    /// Loads a sequence file.
    pub fn load_file(
        &mut self,
        path: impl AsRef<Path>,
        options: &LoadOptions,
    ) -> Result<(), EngineError> {
        let sequence = load_sequence(path, options)?;
        self.load(sequence)
    }

    /// Starts the loaded sequence on a background thread.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let sequence = self.sequence.clone().ok_or(EngineError::NotLoaded)?;

        let root = RootRun::new(Arc::clone(&sequence), self.context.clone());
        let controller = root.controller().clone();
        controller.arm();

        let finished = Event::new();
        let done = finished.clone();
        let handle = thread::Builder::new()
            .name(format!("run:{}", sequence.id))
            .spawn(move || {
                let report = root.run();
                done.set();
                report
            })?;

        info!("Sequence '{}' started", sequence.id);
        self.interrupted = false;
        self.active = Some(ActiveRun {
            controller,
            finished,
            handle,
        });
        Ok(())
    }

    /// Interrupts the run in progress, or unloads the sequence if none was
    /// started.
    pub fn interrupt(&mut self) {
        match &self.active {
            Some(active) => {
                info!("Interrupting sequence '{}'", active.controller.sequence_id());
                self.interrupted = true;
                active.controller.request_stop();
            }
            None => {
                if let Some(sequence) = self.sequence.take() {
                    info!("Sequence '{}' unloaded", sequence.id);
                }
            }
        }
    }

    /// Waits for the run to finish, at most `timeout` if given.
    ///
    /// Returns false if the run is still in progress. Once the run is over
    /// the engine is reset to the unloaded state.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        let done = match timeout {
            Some(timeout) => active.finished.wait_timeout(timeout),
            None => {
                active.finished.wait();
                true
            }
        };
        if !done {
            return false;
        }
        self.finish();
        self.sequence = None;
        true
    }

    fn finish(&mut self) {
        if let Some(active) = self.active.take() {
            match active.handle.join() {
                Ok(report) => self.last_report = Some(report),
                Err(_) => error!("The run thread panicked"),
            }
        }
        self.interrupted = false;
    }

    pub fn is_loaded(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// True while the run thread has not finished.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| !active.finished.is_set())
    }

    pub fn sequence(&self) -> Option<&Arc<Sequence>> {
        self.sequence.as_ref()
    }

    /// Report of the last finished run.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }
}

impl Drop for SequenceEngine {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            if !active.finished.is_set() {
                warn!("Engine dropped during a run; interrupting it");
                active.controller.request_stop();
            }
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionContext, ActionError, ParameterSet};
    use crate::execution::RunState;
    use crate::monitoring::MemorySink;
    use crate::sequence::Block;
    use std::time::Instant;

    fn engine() -> (SequenceEngine, Arc<MemorySink>) {
        struct Noop;
        impl Action for Noop {}

        struct Refuse;
        impl Action for Refuse {
            fn run(&mut self, _ctx: &ActionContext) -> Result<bool, ActionError> {
                Ok(false)
            }
        }

        let mut registry = ActionRegistry::with_builtins();
        registry.register("noop", ParameterSet::new(), |_| Ok(Box::new(Noop) as Box<dyn Action>));
        registry.register("refuse", ParameterSet::new(), |_| {
            Ok(Box::new(Refuse) as Box<dyn Action>)
        });
        let sink = Arc::new(MemorySink::new());
        (SequenceEngine::new(Arc::new(registry), sink.clone()), sink)
    }

    fn sequence(middle: Block) -> Sequence {
        let mut seq = Sequence::new("main");
        let id = middle.id.clone();
        seq.add_block(Block::begin("begin")).unwrap();
        seq.add_block(middle).unwrap();
        seq.add_block(Block::end("end")).unwrap();
        seq.connect_chain(&["begin", id.as_str(), "end"]).unwrap();
        seq
    }

    #[test]
    fn test_start_requires_load() {
        let (mut engine, _) = engine();
        assert!(matches!(engine.start(), Err(EngineError::NotLoaded)));
    }

    #[test]
    fn test_load_rejects_invalid_sequence() {
        let (mut engine, _) = engine();
        let mut seq = Sequence::new("main");
        seq.add_block(Block::end("end")).unwrap();
        let err = engine.load(seq).unwrap_err();
        assert!(matches!(err, EngineError::Load(ref e) if e.is_syntax()));
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_load_rejects_unknown_action() {
        let (mut engine, _) = engine();
        let err = engine
            .load(sequence(Block::action("act", "missing")))
            .unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn test_run_to_completion() {
        let (mut engine, sink) = engine();
        engine.load(sequence(Block::action("act", "noop"))).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));

        assert!(engine.wait(Some(Duration::from_secs(5))));
        assert!(!engine.is_loaded());
        assert!(!engine.is_started());

        let report = engine.last_report().unwrap();
        assert!(report.success);
        assert_eq!(report.state, RunState::Finished);
        assert!(sink.contains_message("PostRun"));
    }

    #[test]
    fn test_load_while_running_is_busy() {
        let (mut engine, _) = engine();
        engine.load(sequence(Block::wait("wait", 10.0, false))).unwrap();
        engine.start().unwrap();

        let err = engine.load(sequence(Block::action("act", "noop"))).unwrap_err();
        assert!(matches!(err, EngineError::Busy));

        engine.interrupt();
        assert!(engine.is_interrupted());
        engine.load(sequence(Block::action("act", "noop"))).unwrap();
        assert!(engine.is_loaded());
        assert!(!engine.last_report().unwrap().success);
    }

    #[test]
    fn test_interrupt_stops_run() {
        let (mut engine, _) = engine();
        engine.load(sequence(Block::wait("wait", 10.0, false))).unwrap();
        engine.start().unwrap();
        assert!(!engine.wait(Some(Duration::from_millis(50))));
        assert!(engine.is_running());

        let start = Instant::now();
        engine.interrupt();
        assert!(engine.wait(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!engine.last_report().unwrap().success);
    }

    #[test]
    fn test_interrupt_reaches_running_backup() {
        let (mut engine, sink) = engine();
        let mut seq = sequence(Block::action("act", "refuse"));
        let mut rescue = sequence(Block::wait("hold", 10.0, false));
        rescue.id = "rescue".to_string();
        seq.set_backup(rescue);
        engine.load(seq).unwrap();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !sink.contains_message("Wait 10s") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(sink.contains_message("Wait 10s"));

        let start = Instant::now();
        engine.interrupt();
        assert!(engine.wait(Some(Duration::from_secs(3))));
        assert!(start.elapsed() < Duration::from_secs(2));

        let report = engine.last_report().unwrap();
        assert!(!report.success);
        assert_eq!(report.state, RunState::FinishedWithBackup);
        assert_eq!(report.backups.len(), 1);
        assert!(!report.backups[0].success);
    }

    #[test]
    fn test_interrupt_before_start_unloads() {
        let (mut engine, _) = engine();
        engine.load(sequence(Block::action("act", "noop"))).unwrap();
        engine.interrupt();
        assert!(!engine.is_loaded());
        assert!(engine.wait(None));
    }
}
