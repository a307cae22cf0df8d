//! Raw process events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw event from a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The type of event
    pub event_type: ProcessEventType,
    /// Optional data associated with the event
    pub data: Option<String>,
}

impl ProcessEvent {
    /// Create a new process event
    pub fn new(event_type: ProcessEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: None,
        }
    }

    /// Create a new process event with data
    pub fn new_with_data(event_type: ProcessEventType, data: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: Some(data),
        }
    }

    /// Create a stdout line event
    pub fn stdout(line: impl Into<String>) -> Self {
        Self::new_with_data(ProcessEventType::Stdout, line.into())
    }

    /// Create a stderr line event
    pub fn stderr(line: impl Into<String>) -> Self {
        Self::new_with_data(ProcessEventType::Stderr, line.into())
    }

    /// The output line carried by this event, if any
    pub fn line(&self) -> Option<&str> {
        match self.event_type {
            ProcessEventType::Stdout | ProcessEventType::Stderr => self.data.as_deref(),
            _ => None,
        }
    }
}

/// Types of raw process events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessEventType {
    /// Process has started
    Started {
        /// Local process id
        pid: u32,
    },
    /// Log line from stdout
    Stdout,
    /// Log line from stderr
    Stderr,
}
