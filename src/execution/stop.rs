//! Cancellation Controller
//!
//! Each sequence run owns a [`StopController`]. Controllers form a tree
//! mirroring sequence nesting: a macro-invoked run gets a child of the
//! invoking run's controller, and a backup run gets a child of the root.
//!
//! A stop request on an armed controller marks it stopped, opens every
//! barrier registered with it so blocked chains can observe the stop, and
//! propagates to its children. On a controller that is not armed the request
//! is only forwarded to the children.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use super::sync::Event;
use crate::monitoring::{LogSink, RunLogger};
use crate::sequence::Sequence;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Armed,
    /// Stop in progress, children not all signalled yet
    Stopping,
    Stopped,
    Disarmed,
}

/// Backup sequences registered by failed runs, shared by every controller
/// of one root run.
#[derive(Debug, Clone, Default)]
pub struct BackupRegistry {
    entries: Arc<Mutex<Vec<Arc<Sequence>>>>,
}

impl BackupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backup once; returns false if it was already registered.
    pub fn register(&self, backup: &Arc<Sequence>) -> bool {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|b| Arc::ptr_eq(b, backup)) {
            return false;
        }
        entries.push(Arc::clone(backup));
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Takes every registered backup, deepest nesting level first.
    ///
    /// Backups of equal level keep their registration order.
    pub fn drain_ordered(&self) -> Vec<Arc<Sequence>> {
        let mut backups: Vec<Arc<Sequence>> = lock(&self.entries).drain(..).collect();
        backups.sort_by(|a, b| b.level.cmp(&a.level));
        backups
    }
}

struct Inner {
    sequence_id: String,
    level: usize,
    state: Mutex<ControllerState>,
    stop: Event,
    starters: Mutex<Vec<Event>>,
    children: Mutex<Vec<StopController>>,
    backups: BackupRegistry,
    sink: Arc<dyn LogSink>,
}

/// Stop mechanism of one sequence run. Clones share the same controller.
#[derive(Clone)]
pub struct StopController {
    inner: Arc<Inner>,
}

impl StopController {
    /// Creates the controller of a root run, with its own backup registry.
    pub fn new(sequence_id: impl Into<String>, level: usize, sink: Arc<dyn LogSink>) -> Self {
        Self::with_registry(sequence_id, level, sink, BackupRegistry::new())
    }

    fn with_registry(
        sequence_id: impl Into<String>,
        level: usize,
        sink: Arc<dyn LogSink>,
        backups: BackupRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sequence_id: sequence_id.into(),
                level,
                state: Mutex::new(ControllerState::Idle),
                stop: Event::new(),
                starters: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                backups,
                sink,
            }),
        }
    }

    /// Creates a child controller for a macro-invoked run.
    ///
    /// The child shares this controller's backup registry.
    pub fn nested(&self, sequence_id: impl Into<String>, level: usize) -> Self {
        let child = Self::with_registry(
            sequence_id,
            level,
            Arc::clone(&self.inner.sink),
            self.inner.backups.clone(),
        );
        self.register_child(&child);
        child
    }

    /// Creates a child controller for a backup run, with its own registry.
    ///
    /// The child is armed before it is registered, so a stop forwarded from
    /// this controller reaches it as soon as it exists.
    pub fn nested_root(&self, sequence_id: impl Into<String>, level: usize) -> Self {
        let child = Self::new(sequence_id, level, Arc::clone(&self.inner.sink));
        child.arm();
        self.register_child(&child);
        child
    }

    pub fn sequence_id(&self) -> &str {
        &self.inner.sequence_id
    }

    pub fn level(&self) -> usize {
        self.inner.level
    }

    pub fn state(&self) -> ControllerState {
        *lock(&self.inner.state)
    }

    /// Arms the controller while its sequence runs.
    pub fn arm(&self) {
        let mut state = lock(&self.inner.state);
        if matches!(*state, ControllerState::Idle | ControllerState::Disarmed) {
            *state = ControllerState::Armed;
        }
    }

    /// Disarms the controller once its sequence finished.
    pub fn disarm(&self) {
        let mut state = lock(&self.inner.state);
        *state = match *state {
            ControllerState::Armed => ControllerState::Disarmed,
            ControllerState::Stopping => ControllerState::Stopped,
            other => other,
        };
    }

    /// Requests the run to stop.
    pub fn request_stop(&self) {
        let armed = {
            let mut state = lock(&self.inner.state);
            match *state {
                ControllerState::Armed => {
                    *state = ControllerState::Stopping;
                    true
                }
                ControllerState::Stopping => return,
                _ => false,
            }
        };

        if armed {
            debug!(
                "Stop requested on '{}' (level {})",
                self.inner.sequence_id, self.inner.level
            );
            RunLogger::new(
                Arc::clone(&self.inner.sink),
                self.inner.sequence_id.as_str(),
                self.inner.level,
                "stop",
                "STOP",
            )
            .info("Stop requested");

            self.inner.stop.set();
            for starter in lock(&self.inner.starters).iter() {
                starter.set();
            }
        }

        let children: Vec<StopController> = lock(&self.inner.children).clone();
        for child in children {
            child.request_stop();
        }

        if armed {
            let mut state = lock(&self.inner.state);
            if *state == ControllerState::Stopping {
                *state = ControllerState::Stopped;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_set()
    }

    /// Latch set when the stop takes effect.
    pub fn stop_event(&self) -> &Event {
        &self.inner.stop
    }

    /// Registers a barrier opened by a stop request.
    ///
    /// A barrier added after the stop is opened immediately.
    pub fn add_starter(&self, starter: Event) {
        let mut starters = lock(&self.inner.starters);
        if self.is_stopped() {
            starter.set();
        }
        starters.push(starter);
    }

    pub fn register_child(&self, child: &StopController) {
        lock(&self.inner.children).push(child.clone());
    }

    pub fn unregister_child(&self, child: &StopController) {
        lock(&self.inner.children).retain(|c| !Arc::ptr_eq(&c.inner, &child.inner));
    }

    pub fn children_count(&self) -> usize {
        lock(&self.inner.children).len()
    }

    /// Registers the backup of a failed sequence, if it declares one.
    pub fn register_backup_candidate(&self, backup: Option<&Arc<Sequence>>) {
        if let Some(backup) = backup {
            if self.inner.backups.register(backup) {
                debug!(
                    "Backup '{}' (level {}) registered by '{}'",
                    backup.id, backup.level, self.inner.sequence_id
                );
            }
        }
    }

    pub fn backups(&self) -> &BackupRegistry {
        &self.inner.backups
    }

    /// Sleeps for `duration` unless a stop arrives first.
    ///
    /// Returns true if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stopped();
        }
        !self.inner.stop.wait_timeout(duration)
    }
}

impl std::fmt::Debug for StopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopController")
            .field("sequence_id", &self.inner.sequence_id)
            .field("level", &self.inner.level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MemorySink;
    use std::time::Instant;

    fn controller(sink: Arc<MemorySink>) -> StopController {
        StopController::new("main", 0, sink)
    }

    fn leveled(id: &str, level: usize) -> Arc<Sequence> {
        let mut seq = Sequence::new(id);
        seq.level = level;
        Arc::new(seq)
    }

    #[test]
    fn test_stop_on_armed_controller() {
        let sink = Arc::new(MemorySink::new());
        let ctl = controller(sink.clone());
        let starter = Event::new();
        ctl.add_starter(starter.clone());

        ctl.arm();
        ctl.request_stop();
        assert!(ctl.is_stopped());
        assert!(starter.is_set());
        assert_eq!(ctl.state(), ControllerState::Stopped);

        let stop_events: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.block_type == "STOP")
            .collect();
        assert_eq!(stop_events.len(), 1);

        // a second request is a no-op
        ctl.request_stop();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_stop_on_idle_forwards_to_children() {
        let sink = Arc::new(MemorySink::new());
        let root = controller(sink);
        let child = root.nested("sub", 1);
        let starter = Event::new();
        child.add_starter(starter.clone());
        child.arm();

        root.request_stop();
        assert!(!root.is_stopped());
        assert!(child.is_stopped());
        assert!(starter.is_set());
    }

    #[test]
    fn test_stop_propagates_from_armed_parent() {
        let sink = Arc::new(MemorySink::new());
        let root = controller(sink);
        let child = root.nested("sub", 1);
        root.arm();
        child.arm();
        root.request_stop();
        assert!(root.is_stopped());
        assert!(child.is_stopped());

        root.unregister_child(&child);
        assert_eq!(root.children_count(), 0);
    }

    #[test]
    fn test_disarm_transitions() {
        let sink = Arc::new(MemorySink::new());
        let ctl = controller(sink);
        assert_eq!(ctl.state(), ControllerState::Idle);
        ctl.arm();
        assert_eq!(ctl.state(), ControllerState::Armed);
        ctl.disarm();
        assert_eq!(ctl.state(), ControllerState::Disarmed);

        // stopping a disarmed controller does not stop it
        ctl.request_stop();
        assert!(!ctl.is_stopped());
    }

    #[test]
    fn test_starter_added_after_stop_is_open() {
        let sink = Arc::new(MemorySink::new());
        let ctl = controller(sink);
        ctl.arm();
        ctl.request_stop();
        let late = Event::new();
        ctl.add_starter(late.clone());
        assert!(late.is_set());
    }

    #[test]
    fn test_backups_run_deepest_first() {
        let registry = BackupRegistry::new();
        for (id, level) in [("b2", 2), ("b0", 0), ("b1", 1)] {
            assert!(registry.register(&leveled(id, level)));
        }
        let order: Vec<String> = registry
            .drain_ordered()
            .iter()
            .map(|b| b.id.clone())
            .collect();
        assert_eq!(order, vec!["b2", "b1", "b0"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_backup_registered_once() {
        let sink = Arc::new(MemorySink::new());
        let root = controller(sink);
        let child = root.nested("sub", 1);
        let backup = leveled("recovery", 1);

        root.register_backup_candidate(Some(&backup));
        child.register_backup_candidate(Some(&backup));
        child.register_backup_candidate(None);
        assert_eq!(root.backups().len(), 1);

        // backup runs get their own registry
        let backup_ctl = root.nested_root("recovery", 1);
        assert!(backup_ctl.backups().is_empty());
    }

    #[test]
    fn test_backup_controller_reachable_once_created() {
        let sink = Arc::new(MemorySink::new());
        let root = controller(sink);
        root.arm();
        root.disarm();

        let backup_ctl = root.nested_root("recovery", 1);
        assert_eq!(backup_ctl.state(), ControllerState::Armed);

        root.request_stop();
        assert!(backup_ctl.is_stopped());
        assert_eq!(backup_ctl.state(), ControllerState::Stopped);
        assert_eq!(root.state(), ControllerState::Disarmed);
    }

    #[test]
    fn test_sleep_interrupted_by_stop() {
        let sink = Arc::new(MemorySink::new());
        let ctl = controller(sink);
        ctl.arm();
        assert!(ctl.sleep(Duration::from_millis(10)));

        let stopper = {
            let ctl = ctl.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                ctl.request_stop();
            })
        };
        let start = Instant::now();
        assert!(!ctl.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        stopper.join().unwrap();
    }
}
