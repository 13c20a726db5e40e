//! Run Timeline
//!
//! Turns the step records of a finished run into start/end events for
//! timing reports and ASCII Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::workflow::{StepState, WorkflowResult};

/// Width of the chart area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the step label column.
const LABEL_WIDTH: usize = 12;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
}

/// A single event in the run timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Timeline of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl ExecutionTimeline {
    /// Creates an empty timeline starting now.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates an empty timeline anchored at `start_time`.
    pub fn starting_at(start_time: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            start_time,
            end_time: None,
        }
    }

    /// Builds a timeline from a run record.
    ///
    /// Every step result contributes a start event and a completed or
    /// failed event. The run's own timestamps bound the chart; a record
    /// without `started_at` is anchored at its earliest step.
    pub fn from_result(result: &WorkflowResult) -> Self {
        let first_step = result.steps.iter().map(|s| s.started_at).min();
        let start_time = result
            .started_at
            .or(first_step)
            .unwrap_or_else(Utc::now);

        let mut timeline = Self::starting_at(start_time);
        timeline.end_time = result.completed_at;

        for step in &result.steps {
            timeline.add_event_at(step.step_id.clone(), EventType::Started, step.started_at);
            let finished = match step.state {
                StepState::Failed => EventType::Failed,
                _ => EventType::Completed,
            };
            timeline.add_event_at(step.step_id.clone(), finished, step.completed_at);
        }

        timeline
    }

    /// Records an event for a step at the current time.
    pub fn add_event(&mut self, step_id: String, event_type: EventType) {
        self.add_event_at(step_id, event_type, Utc::now());
    }

    /// Records an event for a step at a given time.
    pub fn add_event_at(&mut self, step_id: String, event_type: EventType, timestamp: DateTime<Utc>) {
        self.events.push(TimelineEvent {
            step_id,
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Milliseconds from the start to the run end, the last event, or now.
    pub fn elapsed_ms(&self) -> u64 {
        let end = self
            .end_time
            .or_else(|| self.events.iter().map(|e| e.timestamp).max())
            .unwrap_or_else(Utc::now);
        self.offset_ms(end)
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> u64 {
        u64::try_from((at - self.start_time).num_milliseconds()).unwrap_or(0)
    }

    /// Per-step `(start offset, end offset, failed)` in milliseconds.
    fn spans(&self) -> HashMap<String, (u64, u64, bool)> {
        let mut spans: HashMap<String, (u64, u64, bool)> = HashMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    spans.insert(event.step_id.clone(), (offset, offset, false));
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.get_mut(&event.step_id) {
                        span.1 = offset;
                        span.2 = event.event_type == EventType::Failed;
                    }
                }
            }
        }

        spans
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Completed steps are drawn with `#`, failed ones with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        if self.events.is_empty() {
            return output;
        }

        let total = self.elapsed_ms();
        let scale = CHART_WIDTH / total.max(1) as f64;

        let mut rows: Vec<_> = self.spans().into_iter().collect();
        rows.sort_by(|(a_id, (a_start, ..)), (b_id, (b_start, ..))| {
            a_start.cmp(b_start).then_with(|| a_id.cmp(b_id))
        });

        for (step_id, (start, end, failed)) in rows {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;
            let mark = if failed { "x" } else { "#" };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                truncate(&step_id, LABEL_WIDTH),
                " ".repeat(start_pos),
                mark.repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u64> {
        self.spans()
            .into_iter()
            .map(|(step_id, (start, end, _))| (step_id, end.saturating_sub(start)))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
