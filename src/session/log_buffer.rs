use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Per-process ring buffer of captured output and agent log lines.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line for the given process, evicting the oldest when full.
    pub fn push(&self, process: &str, line: String) {
        let mut logs = self.logs.write();
        let entries = logs.entry(process.to_string()).or_default();
        if entries.len() == self.max_lines {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Last `n` lines for a process (all of them if fewer are stored).
    pub fn tail(&self, process: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read();
        let Some(entries) = logs.get(process) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self, process: &str) -> usize {
        self.logs.read().get(process).map_or(0, VecDeque::len)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
