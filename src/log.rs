//! Log entries produced by listener plugins.
//!
//! Plugins never write to the global subscriber themselves. They collect
//! [`LogEntry`] values into their result and the engine forwards them,
//! tagged with its own correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Information,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub step: String,
    pub notes: String,

    /// Position within the producing execution, starting at 1.
    pub counter: u32,

    pub reference_name: String,
    pub reference_value: String,
    pub create_date: DateTime<Utc>,
}

/// Ordered collector handing out increasing counters.
#[derive(Debug, Clone, Default)]
pub struct LogBook {
    reference_name: String,
    reference_value: String,
    entries: Vec<LogEntry>,
}

impl LogBook {
    pub fn new(reference_name: impl Into<String>, reference_value: impl ToString) -> Self {
        Self {
            reference_name: reference_name.into(),
            reference_value: reference_value.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn debug(&mut self, step: impl Into<String>) {
        self.push(LogLevel::Debug, step.into(), String::new());
    }

    pub fn info(&mut self, step: impl Into<String>) {
        self.push(LogLevel::Information, step.into(), String::new());
    }

    pub fn warn(&mut self, step: impl Into<String>) {
        self.push(LogLevel::Warning, step.into(), String::new());
    }

    pub fn error(&mut self, step: impl Into<String>, notes: impl Into<String>) {
        self.push(LogLevel::Error, step.into(), notes.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    fn push(&mut self, level: LogLevel, step: String, notes: String) {
        let counter = self.entries.len() as u32 + 1;
        self.entries.push(LogEntry {
            level,
            step,
            notes,
            counter,
            reference_name: self.reference_name.clone(),
            reference_value: self.reference_value.clone(),
            create_date: Utc::now(),
        });
    }
}

/// Emit plugin entries through `tracing` under the caller's correlation id.
pub fn forward(entries: &[LogEntry], correlation: Uuid) {
    for entry in entries {
        match entry.level {
            LogLevel::Debug => tracing::debug!(
                correlation = %correlation,
                counter = entry.counter,
                reference = %format_args!("{}={}", entry.reference_name, entry.reference_value),
                notes = %entry.notes,
                "{}", entry.step
            ),
            LogLevel::Information => tracing::info!(
                correlation = %correlation,
                counter = entry.counter,
                reference = %format_args!("{}={}", entry.reference_name, entry.reference_value),
                notes = %entry.notes,
                "{}", entry.step
            ),
            LogLevel::Warning => tracing::warn!(
                correlation = %correlation,
                counter = entry.counter,
                reference = %format_args!("{}={}", entry.reference_name, entry.reference_value),
                notes = %entry.notes,
                "{}", entry.step
            ),
            LogLevel::Error => tracing::error!(
                correlation = %correlation,
                counter = entry.counter,
                reference = %format_args!("{}={}", entry.reference_name, entry.reference_value),
                notes = %entry.notes,
                "{}", entry.step
            ),
        }
    }
}
