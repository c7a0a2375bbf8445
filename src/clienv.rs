use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    ConfigDir,
    Log,
    RestartOnRudeEdit,
    NonInteractive,
    AgentPipe,
    TerminationTimeoutSecs,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ConfigDir => "HOTRELOAD_CONFIG_DIR",
            EnvVar::Log => "HOTRELOAD_LOG",
            EnvVar::RestartOnRudeEdit => "HOTRELOAD_RESTART_ON_RUDE_EDIT",
            EnvVar::NonInteractive => "HOTRELOAD_NONINTERACTIVE",
            EnvVar::AgentPipe => "HOTRELOAD_AGENT_PIPE",
            EnvVar::TerminationTimeoutSecs => "HOTRELOAD_TERMINATION_TIMEOUT_SECS",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const HOTRELOAD_SUBDIR: &str = "hotreload";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Config directory ($HOTRELOAD_CONFIG_DIR or ~/.config/hotreload)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfigDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(HOTRELOAD_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Log filter directive ($HOTRELOAD_LOG, falling back to $RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(EnvVar::Log.as_str()).or_else(|| env_opt("RUST_LOG"))
}

/// Restart without prompting on rude edits ($HOTRELOAD_RESTART_ON_RUDE_EDIT)
pub fn restart_on_rude_edit() -> Option<bool> {
    let val = env_opt(EnvVar::RestartOnRudeEdit.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "HOTRELOAD_RESTART_ON_RUDE_EDIT env var");
    val
}

/// Never prompt ($HOTRELOAD_NONINTERACTIVE)
pub fn non_interactive() -> Option<bool> {
    let val = env_opt(EnvVar::NonInteractive.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "HOTRELOAD_NONINTERACTIVE env var");
    val
}

/// Graceful termination timeout override ($HOTRELOAD_TERMINATION_TIMEOUT_SECS)
pub fn termination_timeout_secs() -> Option<u64> {
    env_opt(EnvVar::TerminationTimeoutSecs.as_str()).and_then(|s| s.trim().parse().ok())
}

/// Name of the variable through which a launched process learns its endpoint.
pub fn agent_pipe_var() -> &'static str {
    EnvVar::AgentPipe.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", "off", "", "maybe"] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(agent_pipe_var(), "HOTRELOAD_AGENT_PIPE");
        assert_eq!(EnvVar::ConfigDir.as_str(), "HOTRELOAD_CONFIG_DIR");
    }
}
