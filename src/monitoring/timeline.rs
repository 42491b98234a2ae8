//! Execution Timeline
//!
//! A log sink that follows block state events to track when each block
//! started and finished, and its current visual state. Used for run reports
//! and text Gantt charts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use colored::Colorize;

use super::events::{BlockState, LogEvent, LogSink};

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Block started executing
    Started,
    /// Block completed successfully
    Completed,
    /// Block failed
    Failed,
}

impl EventType {
    fn from_state(state: BlockState) -> Option<Self> {
        match state {
            BlockState::Begin => Some(Self::Started),
            BlockState::Ok => Some(Self::Completed),
            BlockState::Failed => Some(Self::Failed),
            BlockState::NotPassed => None,
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Sequence owning the block
    pub sequence_id: String,
    /// ID of the block
    pub block_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

impl TimelineEvent {
    fn key(&self) -> String {
        format!("{}/{}", self.sequence_id, self.block_id)
    }
}

/// Tracks the execution timeline of the blocks of a run.
///
/// Blocks are keyed as `sequence/block`; a block run several times (inside
/// a macro iterated more than once) keeps its latest timing.
#[derive(Debug)]
pub struct ExecutionTimeline {
    events: Mutex<Vec<TimelineEvent>>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<TimelineEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records an event for a block.
    pub fn add_event(&self, sequence_id: &str, block_id: &str, event_type: EventType) {
        self.guard().push(TimelineEvent {
            sequence_id: sequence_id.to_string(),
            block_id: block_id.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> Vec<TimelineEvent> {
        self.guard().clone()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Current visual state of a block.
    pub fn state_of(&self, sequence_id: &str, block_id: &str) -> BlockState {
        self.guard()
            .iter()
            .rev()
            .find(|e| e.sequence_id == sequence_id && e.block_id == block_id)
            .map_or(BlockState::NotPassed, |e| match e.event_type {
                EventType::Started => BlockState::Begin,
                EventType::Completed => BlockState::Ok,
                EventType::Failed => BlockState::Failed,
            })
    }

    /// Start and end offsets (ms) of every block that finished.
    fn spans(&self) -> Vec<(String, u128, u128, bool)> {
        let mut starts: HashMap<String, u128> = HashMap::new();
        let mut spans: HashMap<String, (u128, u128, bool)> = HashMap::new();

        for event in self.guard().iter() {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.key(), elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(&event.key()) {
                        let ok = event.event_type == EventType::Completed;
                        spans.insert(event.key(), (*start, elapsed, ok));
                    }
                }
            }
        }

        let mut sorted: Vec<_> = spans
            .into_iter()
            .map(|(key, (start, end, ok))| (key, start, end, ok))
            .collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    /// Returns block durations in milliseconds, keyed `sequence/block`.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(key, start, end, _)| (key, end - start))
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (key, start, end, ok) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&(if ok { "#" } else { "x" }).repeat(duration));

            output.push_str(&format!(
                "{:20} |{}| ({} ms)\n",
                truncate(&key, 20),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// One line per finished block with a colored outcome.
    pub fn summary(&self) -> String {
        let spans = self.spans();
        let failed = spans.iter().filter(|s| !s.3).count();
        let mut output = format!(
            "{} block(s) executed, {} failed\n",
            spans.len(),
            failed
        );
        for (key, start, end, ok) in spans {
            let outcome = if ok { "OK".green() } else { "KO".red() };
            output.push_str(&format!("  [{}] {} ({} ms)\n", outcome, key, end - start));
        }
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ExecutionTimeline {
    fn emit(&self, event: LogEvent) {
        if let Some(event_type) = event.state.and_then(EventType::from_state) {
            self.add_event(&event.sequence_id, &event.block_id, event_type);
        }
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::events::RunLogger;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert_eq!(timeline.state_of("main", "act"), BlockState::NotPassed);
    }

    #[test]
    fn test_get_durations() {
        let timeline = ExecutionTimeline::new();
        timeline.add_event("main", "step1", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("main", "step1", EventType::Completed);

        let durations = timeline.get_durations();
        assert!(*durations.get("main/step1").unwrap() >= 50);
    }

    #[test]
    fn test_get_durations_only_started() {
        let timeline = ExecutionTimeline::new();
        timeline.add_event("main", "step1", EventType::Started);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_follows_state_events() {
        let timeline = Arc::new(ExecutionTimeline::new());
        let log = RunLogger::new(timeline.clone(), "main", 0, "act", "ACTION");

        log.state(BlockState::Begin);
        assert_eq!(timeline.state_of("main", "act"), BlockState::Begin);
        log.info("ignored");
        log.state(BlockState::Failed);
        assert_eq!(timeline.state_of("main", "act"), BlockState::Failed);
        assert_eq!(timeline.get_events().len(), 2);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let timeline = ExecutionTimeline::new();
        timeline.add_event("main", "step1", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("main", "step1", EventType::Completed);
        timeline.add_event("main", "step2", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("main", "step2", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("main/step1"));
        assert!(chart.contains("main/step2"));
        assert!(chart.contains("Total:"));

        let summary = timeline.summary();
        assert!(summary.starts_with("2 block(s) executed, 1 failed"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}
