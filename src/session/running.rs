//! A target process admitted to the session.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::UpdateClient;
use super::launcher::{LaunchSpec, ProcessHandle};
use super::reporter::ProcessReporter;
use crate::error::CancelCause;
use crate::update::{Capabilities, ModuleId};

/// Composite cancellation for everything done on behalf of one process:
/// fires on session shutdown or when that process exits.
///
/// Each process has its own scope, so one exit never cancels work for others.
#[derive(Clone)]
pub struct CancelScope {
    shutdown: CancellationToken,
    exited: CancellationToken,
}

impl CancelScope {
    pub fn new(shutdown: CancellationToken, exited: CancellationToken) -> Self {
        Self { shutdown, exited }
    }

    /// Resolves once either signal fires. Shutdown wins when both have fired.
    pub async fn cancelled(&self) -> CancelCause {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CancelCause::Shutdown,
            _ = self.exited.cancelled() => CancelCause::ProcessExited,
        }
    }

    pub fn cause(&self) -> Option<CancelCause> {
        if self.shutdown.is_cancelled() {
            Some(CancelCause::Shutdown)
        } else if self.exited.is_cancelled() {
            Some(CancelCause::ProcessExited)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Launching,
    CatchingUpBacklog,
    Active,
    RestartPending,
    Exited,
    Terminated,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Terminated)
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Launching, CatchingUpBacklog) => true,
            (CatchingUpBacklog, Active) => true,
            (Active, RestartPending) => true,
            // restart declined
            (RestartPending, Active) => true,
            (from, Exited | Terminated) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Launching => "launching",
            ProcessState::CatchingUpBacklog => "catching up",
            ProcessState::Active => "active",
            ProcessState::RestartPending => "restart pending",
            ProcessState::Exited => "exited",
            ProcessState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// What the launcher knows about a process before it connects.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub project_path: PathBuf,
    pub display_name: String,
    /// The process the user launched. Only a root restart restarts the session.
    pub is_root: bool,
    /// Modules this process loads; decides which processes a restart affects.
    pub modules: HashSet<ModuleId>,
}

impl ProcessOptions {
    pub fn new(project_path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            display_name: display_name.into(),
            is_root: false,
            modules: HashSet::new(),
        }
    }

    pub fn root(mut self) -> Self {
        self.is_root = true;
        self
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = ModuleId>) -> Self {
        self.modules = modules.into_iter().collect();
        self
    }
}

pub struct RunningProcess {
    options: ProcessOptions,
    client: Arc<dyn UpdateClient>,
    handle: ProcessHandle,
    reporter: ProcessReporter,
    scope: CancelScope,
    launch: Option<LaunchSpec>,
    state: Mutex<ProcessState>,
}

impl RunningProcess {
    pub(crate) fn new(
        options: ProcessOptions,
        client: Arc<dyn UpdateClient>,
        handle: ProcessHandle,
        reporter: ProcessReporter,
        shutdown: CancellationToken,
        launch: Option<LaunchSpec>,
    ) -> Self {
        let scope = CancelScope::new(shutdown, handle.exited_token());
        Self {
            options,
            client,
            handle,
            reporter,
            scope,
            launch,
            state: Mutex::new(ProcessState::Launching),
        }
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.display_name
    }

    pub fn is_root(&self) -> bool {
        self.options.is_root
    }

    pub fn client(&self) -> &Arc<dyn UpdateClient> {
        &self.client
    }

    pub fn capabilities(&self) -> Capabilities {
        self.client.capabilities()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn reporter(&self) -> &ProcessReporter {
        &self.reporter
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn launch_spec(&self) -> Option<&LaunchSpec> {
        self.launch.as_ref()
    }

    pub fn has_exited(&self) -> bool {
        self.handle.has_exited()
    }

    pub fn loads_any(&self, modules: &[ModuleId]) -> bool {
        modules.iter().any(|m| self.options.modules.contains(m))
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Move to `next` if the lifecycle allows it; returns whether it did.
    pub fn transition(&self, next: ProcessState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            debug!(process = %self.name(), from = %*state, to = %next, "Ignoring state transition");
            return false;
        }
        debug!(process = %self.name(), from = %*state, to = %next, "Process state");
        *state = next;
        true
    }

    /// Stop hot reloading this process and end its OS-level execution.
    pub async fn terminate(&self) {
        self.transition(ProcessState::Terminated);
        self.client.dispose().await;
        self.handle.terminate().await;
    }
}

impl fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningProcess")
            .field("name", &self.options.display_name)
            .field("is_root", &self.options.is_root)
            .field("pid", &self.handle.pid())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use ProcessState::*;
        assert!(Launching.can_transition_to(CatchingUpBacklog));
        assert!(CatchingUpBacklog.can_transition_to(Active));
        assert!(Active.can_transition_to(RestartPending));
        assert!(RestartPending.can_transition_to(Active));
        assert!(RestartPending.can_transition_to(Terminated));
        assert!(CatchingUpBacklog.can_transition_to(Exited));

        assert!(!Launching.can_transition_to(Active));
        assert!(!Exited.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Active));
    }

    #[tokio::test]
    async fn test_scope_reports_exit_cause() {
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();
        let scope = CancelScope::new(shutdown.clone(), exited.clone());
        assert_eq!(scope.cause(), None);

        exited.cancel();
        assert_eq!(scope.cancelled().await, CancelCause::ProcessExited);

        shutdown.cancel();
        assert_eq!(scope.cancelled().await, CancelCause::Shutdown);
        assert_eq!(scope.cause(), Some(CancelCause::Shutdown));
    }

    #[tokio::test]
    async fn test_one_exit_does_not_cancel_siblings() {
        let shutdown = CancellationToken::new();
        let a = CancelScope::new(shutdown.clone(), CancellationToken::new());
        let b_exit = CancellationToken::new();
        let b = CancelScope::new(shutdown.clone(), b_exit.clone());

        b_exit.cancel();
        assert_eq!(b.cause(), Some(CancelCause::ProcessExited));
        assert_eq!(a.cause(), None);
    }
}
