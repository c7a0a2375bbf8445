//! Session coordinator.
//!
//! Owns the running processes and the backlog of every update issued this
//! session. Both live behind one lock so a process's admission point is
//! always consistent with the backlog; the lock is never held across I/O.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{report_cancelled, ApplyStatus, PipeUpdateClient, UpdateClient};
use super::endpoint::AgentEndpoint;
use super::launcher::{LaunchSpec, ProcessHandle, ProcessLauncher};
use super::log_buffer::LogBuffer;
use super::protocol::LoggingLevel;
use super::reporter::ProcessReporter;
use super::restart::RestartPrompt;
use super::running::{CancelScope, ProcessOptions, ProcessState, RunningProcess};
use crate::change::ChangeEvent;
use crate::config::SessionConfig;
use crate::engine::{DeltaEngine, Diagnostic, DiagnosticSeverity, UpdateBatch, UpdateStatus};
use crate::error::{CancelCause, ClientError, Result, SessionError};
use crate::update::{Capabilities, ModuleId, StaticAsset, Update};

struct BacklogEntry {
    seq: u64,
    update: Arc<Update>,
}

/// Append-only list of issued updates. Sequence numbers survive purges, so a
/// process catching up can keep its place while entries are discarded.
#[derive(Default)]
struct Backlog {
    entries: Vec<BacklogEntry>,
    next_seq: u64,
}

impl Backlog {
    fn append(&mut self, updates: &[Arc<Update>]) {
        for update in updates {
            self.entries.push(BacklogEntry {
                seq: self.next_seq,
                update: Arc::clone(update),
            });
            self.next_seq += 1;
        }
    }

    /// Entries at or after `seq`, and the sequence number to resume from.
    fn since(&self, seq: u64) -> (Vec<Arc<Update>>, u64) {
        let start = self.entries.partition_point(|e| e.seq < seq);
        let pending = self.entries[start..]
            .iter()
            .map(|e| Arc::clone(&e.update))
            .collect();
        (pending, self.next_seq)
    }

    fn purge(&mut self, modules: &HashSet<ModuleId>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !modules.contains(&e.update.module_id));
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct SessionState {
    running: HashMap<PathBuf, Vec<Arc<RunningProcess>>>,
    backlog: Backlog,
    disposed: bool,
}

impl SessionState {
    fn snapshot(&self) -> Vec<Arc<RunningProcess>> {
        self.running.values().flatten().cloned().collect()
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> Vec<Arc<RunningProcess>>
    where
        F: FnMut(&Arc<RunningProcess>) -> bool,
    {
        let mut removed = Vec::new();
        self.running.retain(|_, processes| {
            processes.retain(|p| {
                if predicate(p) {
                    removed.push(Arc::clone(p));
                    false
                } else {
                    true
                }
            });
            !processes.is_empty()
        });
        removed
    }
}

/// What happened to one process during a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied(ApplyStatus),
    /// The process exited before or while it was being updated.
    Skipped,
}

#[derive(Debug, Default)]
pub struct DistributionReport {
    pub outcomes: Vec<(Arc<RunningProcess>, ProcessOutcome)>,
}

impl DistributionReport {
    /// Combined status of the processes that took part; skipped ones don't count.
    pub fn aggregate_status(&self) -> ApplyStatus {
        ApplyStatus::combine(self.outcomes.iter().filter_map(|(_, o)| match o {
            ProcessOutcome::Applied(status) => Some(*status),
            ProcessOutcome::Skipped => None,
        }))
    }

    pub fn status_of(&self, process: &Arc<RunningProcess>) -> Option<ProcessOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| Arc::ptr_eq(p, process))
            .map(|(_, o)| *o)
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ProcessOutcome::Applied(s) if s.applied_any()))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDecision {
    NotAffected,
    Restart,
    Declined,
}

#[derive(Debug)]
pub enum ChangeOutcome {
    NoChanges,
    /// Compilation errors; running processes are untouched.
    Blocked,
    Applied {
        updates: DistributionReport,
        assets: Option<DistributionReport>,
    },
    Restart {
        root: RootDecision,
        /// Dependent processes that were terminated and should be launched again.
        relaunch: Vec<Arc<RunningProcess>>,
    },
}

pub struct SessionCoordinator {
    state: Arc<Mutex<SessionState>>,
    shutdown: CancellationToken,
    logging: LoggingLevel,
    logs: Arc<LogBuffer>,
    launcher: ProcessLauncher,
}

impl SessionCoordinator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            shutdown: CancellationToken::new(),
            logging: config.agent_log_level.into(),
            logs: Arc::new(LogBuffer::new(config.log_buffer_lines)),
            launcher: ProcessLauncher::new(config.termination_timeout()),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn processes(&self) -> Vec<Arc<RunningProcess>> {
        self.state.lock().snapshot()
    }

    pub fn root_processes(&self) -> Vec<Arc<RunningProcess>> {
        self.processes().into_iter().filter(|p| p.is_root()).collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.lock().disposed {
            return Err(SessionError::Disposed);
        }
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Shutdown);
        }
        Ok(())
    }

    /// Launch `spec`, wait for its agent to connect and admit it.
    ///
    /// `Ok(None)` means the process exited or failed its handshake; that is
    /// reported on the process, not returned as an error.
    pub async fn start_process(
        &self,
        spec: LaunchSpec,
        options: ProcessOptions,
    ) -> Result<Option<Arc<RunningProcess>>> {
        self.ensure_active()?;

        let reporter = ProcessReporter::new(options.display_name.clone(), Arc::clone(&self.logs));
        let endpoint = AgentEndpoint::bind().await?;
        let handle = self.launcher.launch(&spec, endpoint.name(), &reporter)?;
        let scope = CancelScope::new(self.shutdown.clone(), handle.exited_token());

        let accepted = tokio::select! {
            accepted = endpoint.accept() => accepted.map_err(ClientError::from),
            cause = scope.cancelled() => Err(ClientError::Cancelled(cause)),
        };
        let connected = match accepted {
            Ok(stream) => {
                PipeUpdateClient::connect(stream, reporter.clone(), self.logging, &scope).await
            }
            Err(e) => Err(e),
        };

        let client = match connected {
            Ok(client) => client,
            Err(ClientError::Cancelled(CancelCause::Shutdown)) => {
                handle.terminate().await;
                return Err(SessionError::Shutdown);
            }
            Err(ClientError::Cancelled(CancelCause::ProcessExited)) => {
                reporter.warning(&format!(
                    "Exited before connecting (exit code {:?})",
                    handle.exit_code()
                ));
                return Ok(None);
            }
            Err(e) => {
                reporter.warning(&format!("Failed to connect to hot reload agent: {e}"));
                handle.terminate().await;
                return Ok(None);
            }
        };

        let process = RunningProcess::new(
            options,
            Arc::new(client),
            handle,
            reporter,
            self.shutdown.clone(),
            Some(spec),
        );
        self.admit(Arc::new(process)).await
    }

    /// Admit a process whose handshake already completed.
    pub async fn track_new_process(
        &self,
        client: Arc<dyn UpdateClient>,
        options: ProcessOptions,
        handle: ProcessHandle,
    ) -> Result<Option<Arc<RunningProcess>>> {
        let reporter = ProcessReporter::new(options.display_name.clone(), Arc::clone(&self.logs));
        let process = RunningProcess::new(
            options,
            client,
            handle,
            reporter,
            self.shutdown.clone(),
            None,
        );
        self.admit(Arc::new(process)).await
    }

    async fn admit(&self, process: Arc<RunningProcess>) -> Result<Option<Arc<RunningProcess>>> {
        // a process that never becomes active still owns its channel
        match self.catch_up(&process).await {
            Ok(true) => {}
            Ok(false) => {
                process.client().dispose().await;
                return Ok(None);
            }
            Err(e) => {
                process.client().dispose().await;
                return Err(e);
            }
        }

        self.watch_exit(&process);

        match process.client().initial_updates_completed(process.scope()).await {
            Ok(()) => {}
            Err(ClientError::Cancelled(cause)) => {
                report_cancelled(process.reporter(), cause, "Initial updates notice");
            }
            Err(e) => process
                .reporter()
                .warning(&format!("Failed to signal initial updates: {e}")),
        }

        info!(
            process = %process.name(),
            capabilities = %process.capabilities(),
            "Hot reload active"
        );
        Ok(Some(process))
    }

    /// Replay the backlog and register the process. `Ok(false)` if it exited first.
    async fn catch_up(&self, process: &Arc<RunningProcess>) -> Result<bool> {
        self.ensure_active()?;
        process.transition(ProcessState::CatchingUpBacklog);

        // Send backlog without the lock, then re-check under it; only an
        // unchanged backlog lets the process become visible to distribute.
        let mut next_seq = 0;
        loop {
            let pending = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(SessionError::Disposed);
                }
                if process.has_exited() {
                    process.transition(ProcessState::Exited);
                    process.reporter().verbose("Exited while catching up");
                    return Ok(false);
                }

                let (pending, resume_at) = state.backlog.since(next_seq);
                if pending.is_empty() {
                    state
                        .running
                        .entry(process.options().project_path.clone())
                        .or_default()
                        .push(Arc::clone(process));
                    process.transition(ProcessState::Active);
                    return Ok(true);
                }
                next_seq = resume_at;
                pending
            };

            debug!(process = %process.name(), count = pending.len(), "Catching up on backlog");
            match process.client().apply(&pending, process.scope()).await {
                Ok(status) => {
                    debug!(process = %process.name(), status = ?status, "Backlog applied")
                }
                Err(cause) => {
                    report_cancelled(process.reporter(), cause, "Backlog catch-up");
                    if cause == CancelCause::Shutdown {
                        return Err(SessionError::Shutdown);
                    }
                    process.transition(ProcessState::Exited);
                    return Ok(false);
                }
            }
        }
    }

    /// Drop the process from the session once it exits on its own.
    fn watch_exit(&self, process: &Arc<RunningProcess>) {
        let state = Arc::clone(&self.state);
        let process = Arc::clone(process);
        tokio::spawn(async move {
            process.handle().wait().await;
            if process.transition(ProcessState::Exited) {
                process.reporter().verbose(&format!(
                    "Exited (exit code {:?})",
                    process.handle().exit_code()
                ));
            }
            state.lock().remove_where(|p| Arc::ptr_eq(p, &process));
            process.client().dispose().await;
        });
    }

    /// Union of the capabilities of every live process.
    pub fn aggregate_capabilities(&self) -> Capabilities {
        let state = self.state.lock();
        let mut capabilities = Capabilities::default();
        for process in state.running.values().flatten() {
            if !process.has_exited() {
                capabilities.union_with(&process.capabilities());
            }
        }
        capabilities
    }

    /// Record `updates` in the backlog and apply them to every active process.
    ///
    /// Per-process failures show up in the report and never stop the others.
    /// Only session shutdown aborts the whole distribution.
    pub async fn distribute(&self, updates: Vec<Update>) -> Result<DistributionReport> {
        let updates: Vec<Arc<Update>> = updates.into_iter().map(Arc::new).collect();

        let processes = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(SessionError::Disposed);
            }
            if updates.is_empty() {
                return Ok(DistributionReport::default());
            }
            state.backlog.append(&updates);
            state.snapshot()
        };

        let updates = &updates;
        let outcomes = join_all(processes.into_iter().map(|process| async move {
            if process.has_exited() {
                return (process, Err(CancelCause::ProcessExited));
            }
            let result = process.client().apply(updates, process.scope()).await;
            (process, result)
        }))
        .await;

        self.collect_outcomes(outcomes, "Update")
    }

    /// Send refreshed static assets to every active process.
    pub async fn distribute_static_assets(
        &self,
        assets: Vec<StaticAsset>,
    ) -> Result<DistributionReport> {
        self.ensure_active()?;
        if assets.is_empty() {
            return Ok(DistributionReport::default());
        }

        let assets = &assets;
        let outcomes = join_all(self.processes().into_iter().map(|process| async move {
            if process.has_exited() {
                return (process, Err(CancelCause::ProcessExited));
            }
            let result = process
                .client()
                .apply_static_assets(assets, process.scope())
                .await;
            (process, result)
        }))
        .await;

        self.collect_outcomes(outcomes, "Static asset update")
    }

    fn collect_outcomes(
        &self,
        outcomes: Vec<(Arc<RunningProcess>, std::result::Result<ApplyStatus, CancelCause>)>,
        what: &str,
    ) -> Result<DistributionReport> {
        let mut report = DistributionReport::default();
        let mut shutdown = false;

        for (process, result) in outcomes {
            let outcome = match result {
                Ok(status) => ProcessOutcome::Applied(status),
                Err(cause) => {
                    report_cancelled(process.reporter(), cause, what);
                    shutdown |= cause == CancelCause::Shutdown;
                    ProcessOutcome::Skipped
                }
            };
            report.outcomes.push((process, outcome));
        }

        if shutdown {
            return Err(SessionError::Shutdown);
        }
        Ok(report)
    }

    /// Forget issued updates for `modules` and make their current code the baseline.
    ///
    /// Used when those modules are about to be rebuilt from scratch.
    pub async fn discard_baselines(&self, modules: &[ModuleId], engine: &dyn DeltaEngine) {
        let set: HashSet<ModuleId> = modules.iter().copied().collect();
        let purged = self.state.lock().backlog.purge(&set);
        debug!(modules = modules.len(), purged, "Discarded backlog entries");
        engine.update_baselines(modules).await;
    }

    /// Remove matching processes and stop them, returning once they have exited.
    pub async fn terminate<F>(&self, predicate: F) -> Vec<Arc<RunningProcess>>
    where
        F: FnMut(&Arc<RunningProcess>) -> bool,
    {
        let removed = self.state.lock().remove_where(predicate);
        join_all(removed.iter().map(|p| p.terminate())).await;
        removed
    }

    /// Remove the processes of `projects` (or all), stopping the non-root ones.
    ///
    /// Root entries are removed but left running; restarting them is up to the caller.
    pub async fn terminate_non_root(
        &self,
        projects: Option<&[PathBuf]>,
    ) -> Vec<Arc<RunningProcess>> {
        let removed = self.state.lock().remove_where(|p| {
            projects.map_or(true, |paths| paths.contains(&p.options().project_path))
        });

        join_all(
            removed
                .iter()
                .filter(|p| !p.is_root())
                .map(|p| p.terminate()),
        )
        .await;
        removed
    }

    /// Remove and stop one process. Returns false if it was no longer tracked.
    pub async fn terminate_process(&self, process: &Arc<RunningProcess>) -> bool {
        let removed = self.terminate(|p| Arc::ptr_eq(p, process)).await;
        !removed.is_empty()
    }

    /// Cancel everything in flight and stop all dependent processes.
    ///
    /// Returns the root processes, which are left running for the caller.
    pub async fn shutdown(&self) -> Vec<Arc<RunningProcess>> {
        info!("Shutting down hot reload session");
        self.shutdown.cancel();
        let removed = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.remove_where(|_| true)
        };

        let (roots, dependents): (Vec<_>, Vec<_>) = removed.into_iter().partition(|p| p.is_root());
        join_all(dependents.iter().map(|p| p.terminate())).await;
        join_all(roots.iter().map(|p| p.client().dispose())).await;
        roots
    }

    /// Relaunch processes terminated by a restart decision.
    pub async fn relaunch(
        &self,
        processes: &[Arc<RunningProcess>],
    ) -> Result<Vec<Arc<RunningProcess>>> {
        let mut started = Vec::new();
        for process in processes {
            let Some(spec) = process.launch_spec() else {
                warn!(
                    process = %process.name(),
                    "Cannot relaunch a process that was not started by the session"
                );
                continue;
            };
            if let Some(new) = self
                .start_process(spec.clone(), process.options().clone())
                .await?
            {
                started.push(new);
            }
        }
        Ok(started)
    }

    /// Live processes that load any of `modules`.
    pub fn processes_loading(&self, modules: &[ModuleId]) -> Vec<Arc<RunningProcess>> {
        self.processes()
            .into_iter()
            .filter(|p| !p.has_exited() && p.loads_any(modules))
            .collect()
    }

    /// Turn one batch of file changes into updates and act on the engine's verdict.
    pub async fn handle_changes(
        &self,
        engine: &dyn DeltaEngine,
        changed: &[ChangeEvent],
        prompt: &RestartPrompt,
    ) -> Result<ChangeOutcome> {
        self.ensure_active()?;

        let capabilities = self.aggregate_capabilities();
        let batch = engine.produce_updates(&capabilities, changed).await;

        let affected = match batch.status {
            UpdateStatus::RestartRequired => self.processes_loading(&batch.restart_required),
            _ => Vec::new(),
        };
        let demote_rude_edits =
            batch.status == UpdateStatus::RestartRequired && affected.is_empty();
        report_diagnostics(&batch.diagnostics, demote_rude_edits);

        match batch.status {
            UpdateStatus::NoChanges => {
                debug!("No code changes to apply");
                Ok(ChangeOutcome::NoChanges)
            }
            UpdateStatus::Blocked => {
                warn!("Changes were not applied because of compilation errors");
                Ok(ChangeOutcome::Blocked)
            }
            UpdateStatus::RestartRequired if affected.is_empty() => {
                // nothing running loads these modules; the edit waits for the next build
                debug!(
                    modules = batch.restart_required.len(),
                    "Rude edit in modules no process has loaded"
                );
                Ok(ChangeOutcome::NoChanges)
            }
            UpdateStatus::RestartRequired => {
                self.restart_affected(engine, &batch.restart_required, affected, prompt)
                    .await
            }
            UpdateStatus::Ready => self.apply_batch(batch).await,
        }
    }

    async fn apply_batch(&self, batch: UpdateBatch) -> Result<ChangeOutcome> {
        let updates = self.distribute(batch.updates).await?;
        let assets = if batch.static_assets.is_empty() {
            None
        } else {
            Some(self.distribute_static_assets(batch.static_assets).await?)
        };

        match updates.aggregate_status() {
            ApplyStatus::Failed => warn!("Some processes failed to apply changes"),
            ApplyStatus::NoChangesApplied if !updates.outcomes.is_empty() => {
                info!("No process could apply the changes")
            }
            status => info!(
                status = ?status,
                processes = updates.outcomes.len(),
                "Hot reload succeeded"
            ),
        }

        Ok(ChangeOutcome::Applied { updates, assets })
    }

    async fn restart_affected(
        &self,
        engine: &dyn DeltaEngine,
        modules: &[ModuleId],
        affected: Vec<Arc<RunningProcess>>,
        prompt: &RestartPrompt,
    ) -> Result<ChangeOutcome> {
        let (roots, dependents): (Vec<_>, Vec<_>) = affected.into_iter().partition(|p| p.is_root());

        let mut relaunch = Vec::new();
        if !dependents.is_empty() {
            for process in &dependents {
                process.transition(ProcessState::RestartPending);
                info!(process = %process.name(), "Restarting to apply unsupported changes");
            }
            relaunch = self
                .terminate(|p| dependents.iter().any(|d| Arc::ptr_eq(d, p)))
                .await;
        }

        let root = if roots.is_empty() {
            RootDecision::NotAffected
        } else {
            if roots.len() > 1 {
                warn!(
                    count = roots.len(),
                    "Several root processes are affected; one answer applies to all of them"
                );
            }
            for process in &roots {
                process.transition(ProcessState::RestartPending);
            }

            let names: Vec<&str> = roots.iter().map(|p| p.name()).collect();
            if prompt.confirm(&names).await {
                self.terminate(|p| roots.iter().any(|r| Arc::ptr_eq(r, p)))
                    .await;
                RootDecision::Restart
            } else {
                for process in &roots {
                    process.transition(ProcessState::Active);
                }
                info!("Restart declined; fix the unsupported edit to continue hot reloading");
                RootDecision::Declined
            }
        };

        if !relaunch.is_empty() || root == RootDecision::Restart {
            self.discard_baselines(modules, engine).await;
        }

        Ok(ChangeOutcome::Restart { root, relaunch })
    }
}

/// Errors first, then warnings, then the rest, each group in engine order.
pub fn diagnostic_display_order(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
    let mut ordered: Vec<&Diagnostic> = diagnostics.iter().collect();
    ordered.sort_by_key(|d| d.severity);
    ordered
}

fn report_diagnostics(diagnostics: &[Diagnostic], demote_rude_edits: bool) {
    for d in diagnostic_display_order(diagnostics) {
        if d.is_rude_edit && demote_rude_edits {
            debug!(id = %d.id, "{}", d.message);
            continue;
        }
        match d.severity {
            DiagnosticSeverity::Error => error!(id = %d.id, "{}", d.message),
            DiagnosticSeverity::Warning => warn!(id = %d.id, "{}", d.message),
            DiagnosticSeverity::Info => info!(id = %d.id, "{}", d.message),
        }
    }
}
