//! Run Reporting Module
//!
//! Provides utilities for reporting on finished workflow runs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
