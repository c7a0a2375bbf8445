use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clienv;
use crate::session::protocol::LoggingLevel;

const DEFAULT_DEBOUNCE_MS: u64 = 50;
const DEFAULT_EXTENDED_DEBOUNCE_MS: u64 = 200;
const DEFAULT_TERMINATION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_BUFFER_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentLogLevel {
    #[default]
    ErrorsAndWarnings,
    Verbose,
}

impl From<AgentLogLevel> for LoggingLevel {
    fn from(level: AgentLogLevel) -> Self {
        match level {
            AgentLogLevel::ErrorsAndWarnings => LoggingLevel::WarningsAndErrors,
            AgentLogLevel::Verbose => LoggingLevel::Verbose,
        }
    }
}

/// Settings read from `config.toml`. Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period before a batch of file changes is handed to the engine
    pub debounce_ms: u64,
    /// Window used once when a batch contains additions or deletions
    pub extended_debounce_ms: u64,
    pub agent_log_level: AgentLogLevel,
    /// `None` prompts on rude edits, `Some(true)` restarts, `Some(false)` never restarts
    pub restart_on_rude_edit: Option<bool>,
    pub non_interactive: bool,
    pub termination_timeout_secs: u64,
    pub log_buffer_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            extended_debounce_ms: DEFAULT_EXTENDED_DEBOUNCE_MS,
            agent_log_level: AgentLogLevel::default(),
            restart_on_rude_edit: None,
            non_interactive: false,
            termination_timeout_secs: DEFAULT_TERMINATION_TIMEOUT_SECS,
            log_buffer_lines: DEFAULT_LOG_BUFFER_LINES,
        }
    }
}

impl SessionConfig {
    /// $HOTRELOAD_CONFIG_DIR/config.toml or ~/.config/hotreload/config.toml
    pub fn config_path() -> PathBuf {
        clienv::config_dir().join("config.toml")
    }

    /// Load the settings file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading session config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            debounce_ms = config.debounce_ms,
            restart_on_rude_edit = ?config.restart_on_rude_edit,
            "Session config loaded"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(restart) = clienv::restart_on_rude_edit() {
            self.restart_on_rude_edit = Some(restart);
        }
        if let Some(non_interactive) = clienv::non_interactive() {
            self.non_interactive = non_interactive;
        }
        if let Some(secs) = clienv::termination_timeout_secs() {
            self.termination_timeout_secs = secs;
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn extended_debounce(&self) -> Duration {
        Duration::from_millis(self.extended_debounce_ms.max(self.debounce_ms))
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }
}
