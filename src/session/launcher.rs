use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reporter::ProcessReporter;
use crate::clienv;
use crate::error::{Result, SessionError};

/// How to start a target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// A launched process: its exit signal and a way to stop it.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: CancellationToken,
    terminate: CancellationToken,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl ProcessHandle {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            exited: CancellationToken::new(),
            terminate: CancellationToken::new(),
            exit_code: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle not backed by an OS process; terminating it just signals exit.
    pub fn detached() -> Self {
        let handle = Self::new(None);
        let terminate = handle.terminate.clone();
        let exited = handle.exited.clone();
        tokio::spawn(async move {
            terminate.cancelled().await;
            exited.cancel();
        });
        handle
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Fires when the process has exited, for whatever reason.
    pub fn exited_token(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub async fn wait(&self) {
        self.exited.cancelled().await
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Ask the process to stop and wait until it has.
    pub async fn terminate(&self) {
        self.terminate.cancel();
        self.exited.cancelled().await;
    }

    #[cfg(test)]
    pub(crate) fn mark_exited(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
        self.exited.cancel();
    }
}

pub struct ProcessLauncher {
    termination_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(termination_timeout: Duration) -> Self {
        Self {
            termination_timeout,
        }
    }

    /// Start `spec`, telling it where to connect through the agent pipe variable.
    ///
    /// The endpoint must already be listening.
    pub fn launch(
        &self,
        spec: &LaunchSpec,
        endpoint_name: &str,
        reporter: &ProcessReporter,
    ) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env(clienv::agent_pipe_var(), endpoint_name);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!(process = %reporter.name(), program = %spec.program, "Failed to launch: {}", e);
            SessionError::Launch(e)
        })?;

        let handle = ProcessHandle::new(child.id());
        info!(process = %reporter.name(), pid = ?handle.pid, "Launched");

        spawn_log_readers(&mut child, reporter);
        spawn_waiter(
            child,
            handle.clone(),
            reporter.clone(),
            self.termination_timeout,
        );

        Ok(handle)
    }
}

/// Owns the child until it exits, then fires the handle's exit signal.
fn spawn_waiter(
    mut child: Child,
    handle: ProcessHandle,
    reporter: ProcessReporter,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = handle.terminate.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status,
            None => stop_gracefully(&mut child, timeout, reporter.name()).await,
        };

        match status {
            Ok(status) => {
                *handle.exit_code.lock() = status.code();
                debug!(process = %reporter.name(), code = ?status.code(), "Process exited");
            }
            Err(e) => warn!(process = %reporter.name(), "Failed to wait for process: {}", e),
        }

        handle.exited.cancel();
    });
}

async fn stop_gracefully(
    child: &mut Child,
    timeout: Duration,
    name: &str,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            info!(process = %name, "Stopping process gracefully");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => return status,
                Err(_) => warn!(process = %name, "Process did not stop in time, force killing"),
            }
        }
    }

    #[cfg(not(unix))]
    let _ = timeout;

    child.kill().await?;
    child.wait().await
}

/// Capture stdout/stderr of the child into the reporter's buffer.
fn spawn_log_readers(child: &mut Child, reporter: &ProcessReporter) {
    if let Some(stdout) = child.stdout.take() {
        let reporter = reporter.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reporter.captured(line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let reporter = reporter.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reporter.captured(line);
            }
        });
    }
}
