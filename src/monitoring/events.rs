//! Structured Run Events
//!
//! Every step of a run reports through an injected [`LogSink`] instead of a
//! global logger, so concurrent runs never share logging state. Events carry
//! the owning sequence, its nesting level, the block and its type tag, and an
//! optional [`BlockState`] payload used to draw live block states.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use log::Level;
use serde::{Deserialize, Serialize, Serializer};

/// Target used when events are forwarded to the `log` facade.
pub const LOG_TARGET: &str = "sequence";

/// Visual state of a block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    #[serde(rename = "NP")]
    NotPassed,
    #[serde(rename = "BG")]
    Begin,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Failed,
}

impl BlockState {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotPassed => "NP",
            Self::Begin => "BG",
            Self::Ok => "OK",
            Self::Failed => "KO",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One event of a run.
#[derive(Serialize, Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub sequence_id: String,
    pub level: usize,
    pub block_id: String,
    /// Upper-case type tag (`ACTION`, `BRANCH`, `STOP`, ...)
    pub block_type: String,
    #[serde(serialize_with = "serialize_severity")]
    pub severity: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BlockState>,
}

fn serialize_severity<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(level.as_str())
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match (&self.message, &self.state) {
            (Some(msg), _) => msg.clone(),
            (None, Some(state)) => state.to_string(),
            (None, None) => String::new(),
        };
        write!(
            f,
            "{:<12} | {:<8} | {:<12} | {}",
            self.sequence_id, self.block_type, self.block_id, text
        )
    }
}

/// Receiver of run events.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Re-emits events through the `log` facade under the `sequence` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogForwarder;

impl LogSink for LogForwarder {
    fn emit(&self, event: LogEvent) {
        log::log!(target: LOG_TARGET, event.severity, "{}", event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<LogEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Messages logged for a block, in emission order.
    pub fn messages_for(&self, block_id: &str) -> Vec<String> {
        self.guard()
            .iter()
            .filter(|e| e.block_id == block_id)
            .filter_map(|e| e.message.clone())
            .collect()
    }

    /// States reported for a block of a sequence, in emission order.
    pub fn states_for(&self, sequence_id: &str, block_id: &str) -> Vec<BlockState> {
        self.guard()
            .iter()
            .filter(|e| e.sequence_id == sequence_id && e.block_id == block_id)
            .filter_map(|e| e.state)
            .collect()
    }

    /// Returns true if any event carries the given message text.
    pub fn contains_message(&self, needle: &str) -> bool {
        self.guard()
            .iter()
            .any(|e| e.message.as_deref().map_or(false, |m| m.contains(needle)))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        self.guard().push(event);
    }
}

/// Duplicates events to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutSink {
    fn emit(&self, event: LogEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// A sink scoped to one block of one sequence run.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<dyn LogSink>,
    sequence_id: String,
    level: usize,
    block_id: String,
    block_type: String,
}

impl RunLogger {
    pub fn new(
        sink: Arc<dyn LogSink>,
        sequence_id: impl Into<String>,
        level: usize,
        block_id: impl Into<String>,
        block_type: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            sequence_id: sequence_id.into(),
            level,
            block_id: block_id.into(),
            block_type: block_type.into(),
        }
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    fn event(&self, severity: Level, message: Option<String>, state: Option<BlockState>) -> LogEvent {
        LogEvent {
            timestamp: Local::now(),
            sequence_id: self.sequence_id.clone(),
            level: self.level,
            block_id: self.block_id.clone(),
            block_type: self.block_type.clone(),
            severity,
            message,
            state,
        }
    }

    pub fn log(&self, severity: Level, message: impl Into<String>) {
        self.sink.emit(self.event(severity, Some(message.into()), None));
    }

    /// Emits a bare event (no message, no state).
    pub fn mark(&self, severity: Level) {
        self.sink.emit(self.event(severity, None, None));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    /// Reports a state change of the block.
    pub fn state(&self, state: BlockState) {
        self.sink.emit(self.event(Level::Debug, None, Some(state)));
    }
}

impl fmt::Debug for RunLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLogger")
            .field("sequence_id", &self.sequence_id)
            .field("level", &self.level)
            .field("block_id", &self.block_id)
            .field("block_type", &self.block_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(sink: Arc<dyn LogSink>) -> RunLogger {
        RunLogger::new(sink, "main", 0, "act", "ACTION")
    }

    #[test]
    fn test_run_logger_tags_events() {
        let sink = Arc::new(MemorySink::new());
        let log = logger(sink.clone());
        log.info("hello");
        log.state(BlockState::Begin);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_id, "main");
        assert_eq!(events[0].block_type, "ACTION");
        assert_eq!(events[0].severity, Level::Info);
        assert_eq!(events[0].message.as_deref(), Some("hello"));
        assert_eq!(events[1].state, Some(BlockState::Begin));
        assert_eq!(events[1].severity, Level::Debug);
    }

    #[test]
    fn test_memory_sink_queries() {
        let sink = Arc::new(MemorySink::new());
        let log = logger(sink.clone());
        log.state(BlockState::Begin);
        log.warning("careful");
        log.state(BlockState::Failed);

        assert_eq!(
            sink.states_for("main", "act"),
            vec![BlockState::Begin, BlockState::Failed]
        );
        assert_eq!(sink.messages_for("act"), vec!["careful"]);
        assert!(sink.contains_message("care"));
        assert!(sink.states_for("other", "act").is_empty());

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_fanout_duplicates() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        logger(Arc::new(fanout)).error("boom");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_event_display_and_json() {
        let sink = Arc::new(MemorySink::new());
        let log = logger(sink.clone());
        log.state(BlockState::Ok);
        let event = &sink.events()[0];

        let text = event.to_string();
        assert!(text.contains("ACTION"));
        assert!(text.ends_with("OK"));

        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["state"], "OK");
        assert_eq!(json["severity"], "DEBUG");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_block_state_codes() {
        assert_eq!(BlockState::NotPassed.code(), "NP");
        assert_eq!(BlockState::Begin.code(), "BG");
        assert_eq!(
            serde_json::from_str::<BlockState>("\"KO\"").unwrap(),
            BlockState::Failed
        );
    }
}
