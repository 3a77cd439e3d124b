use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::types::ListenerInstanceId;

/// Where and how a plugin instance delivers.
///
/// Set once by the resolver right after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTarget {
    pub url: String,

    /// Per-call timeout in minutes. Zero is treated as one minute.
    pub timeout_minutes: u32,

    /// Outbound headers in `Name: value` form.
    pub headers: Vec<String>,
}

impl ListenerTarget {
    pub fn new(url: impl Into<String>, timeout_minutes: u32, headers: Vec<String>) -> Self {
        Self {
            url: url.into(),
            timeout_minutes,
            headers,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes.max(1)) * 60)
    }
}

/// Outcome of one plugin execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerResult {
    pub succeeded: bool,
    pub message: String,

    /// Entries in the order they were produced.
    pub logs: Vec<LogEntry>,
}

impl ListenerResult {
    pub fn success(message: impl Into<String>, logs: Vec<LogEntry>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
            logs,
        }
    }

    pub fn failure(message: impl Into<String>, logs: Vec<LogEntry>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
            logs,
        }
    }
}

/// Extension point implemented by every listener type.
///
/// Implementations must be safe to retry and report errors through
/// [`ListenerResult`] rather than panicking. The engine still guards
/// against panics.
#[async_trait]
pub trait Listener: Send + Sync {
    fn configure(&mut self, target: ListenerTarget);

    fn target(&self) -> &ListenerTarget;

    /// Deliver `event_data`. `type_options` holds the plugin-specific
    /// configuration string, possibly empty.
    async fn execute(
        &self,
        listener_instance_id: ListenerInstanceId,
        event_data: &str,
        type_options: &str,
    ) -> ListenerResult;
}
