use std::sync::Arc;

use tracing::{debug, error, warn};

use super::log_buffer::LogBuffer;
use super::protocol::{AgentSeverity, LogEntry};

/// Reports on behalf of one target process.
///
/// Everything goes to `tracing` tagged with the process name and is also kept
/// in the shared [`LogBuffer`] so the last lines of a process can be shown
/// after it fails.
#[derive(Clone)]
pub struct ProcessReporter {
    name: String,
    logs: Arc<LogBuffer>,
}

impl ProcessReporter {
    pub fn new(name: impl Into<String>, logs: Arc<LogBuffer>) -> Self {
        Self {
            name: name.into(),
            logs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward a log entry received from the process's agent.
    pub fn agent_log(&self, entry: &LogEntry) {
        match entry.severity {
            AgentSeverity::Verbose => debug!(process = %self.name, "{}", entry.message),
            AgentSeverity::Warning => warn!(process = %self.name, "{}", entry.message),
            AgentSeverity::Error => error!(process = %self.name, "{}", entry.message),
        }
        self.logs.push(&self.name, format!("[agent] {}", entry.message));
    }

    pub fn verbose(&self, message: &str) {
        debug!(process = %self.name, "{}", message);
        self.logs.push(&self.name, message.to_string());
    }

    pub fn warning(&self, message: &str) {
        warn!(process = %self.name, "{}", message);
        self.logs.push(&self.name, message.to_string());
    }

    /// A line the child wrote to stdout or stderr.
    pub fn captured(&self, line: String) {
        self.logs.push(&self.name, line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        self.logs.tail(&self.name, n)
    }
}
