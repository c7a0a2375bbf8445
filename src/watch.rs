//! The hot-reload loop: watcher events in, updates or restarts out.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::change::{summarize, ChangeAccumulator, ChangeEvent};
use crate::config::SessionConfig;
use crate::engine::DeltaEngine;
use crate::error::{Result, SessionError};
use crate::session::{
    ChangeOutcome, RestartPrompt, RootDecision, RunningProcess, SessionCoordinator,
};
use crate::update::BASELINE_CAPABILITY;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// A root process exited on its own.
    RootExited,
    /// Root processes were terminated and should be launched again.
    RestartRoot,
    /// The watcher stopped sending events.
    WatcherClosed,
}

pub struct HotReloadLoop<'a> {
    coordinator: &'a SessionCoordinator,
    engine: &'a dyn DeltaEngine,
    prompt: &'a RestartPrompt,
    accumulator: ChangeAccumulator,
    project_dir: Option<PathBuf>,
}

impl<'a> HotReloadLoop<'a> {
    pub fn new(
        coordinator: &'a SessionCoordinator,
        engine: &'a dyn DeltaEngine,
        prompt: &'a RestartPrompt,
        config: &SessionConfig,
    ) -> Self {
        Self {
            coordinator,
            engine,
            prompt,
            accumulator: ChangeAccumulator::new(config.debounce(), config.extended_debounce()),
            project_dir: None,
        }
    }

    /// Report changed paths relative to `dir`.
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ChangeEvent>) -> Result<LoopExit> {
        let shutdown = self.coordinator.shutdown_token();
        let roots = self.coordinator.root_processes();
        if roots.is_empty() {
            debug!("No root process; loop ends only on shutdown or watcher close");
        }

        let mut deadline: Option<Instant> = None;
        let mut closed = false;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(LoopExit::Shutdown),
                _ = any_exited(&roots) => {
                    info!("Root process exited");
                    return Ok(LoopExit::RootExited);
                }
                event = events.recv(), if !closed => match event {
                    Some(event) => {
                        self.accumulator.push(event);
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.accumulator.window());
                        }
                        continue;
                    }
                    None => closed = true,
                },
                _ = sleep_until(deadline) => {}
            }

            deadline = None;

            let Some(changes) = self.accumulator.poll_batch() else {
                if !self.accumulator.is_empty() {
                    deadline = Some(Instant::now() + self.accumulator.window());
                } else if closed {
                    return Ok(LoopExit::WatcherClosed);
                }
                continue;
            };

            match self.process_batch(&roots, &changes).await {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(SessionError::Shutdown | SessionError::Disposed) => {
                    return Ok(LoopExit::Shutdown)
                }
                Err(e) => return Err(e),
            }

            if closed && self.accumulator.is_empty() {
                return Ok(LoopExit::WatcherClosed);
            }
        }
    }

    async fn process_batch(
        &self,
        roots: &[Arc<RunningProcess>],
        changes: &[ChangeEvent],
    ) -> Result<Option<LoopExit>> {
        for line in summarize(changes, self.project_dir.as_deref()) {
            info!("{}", line);
        }

        let unsupported: Vec<&Arc<RunningProcess>> = roots
            .iter()
            .filter(|r| !r.capabilities().contains(BASELINE_CAPABILITY))
            .collect();
        if !unsupported.is_empty() {
            let names: Vec<&str> = unsupported.iter().map(|r| r.name()).collect();
            warn!(
                processes = %names.join(", "),
                "Hot reload is not supported; a restart is needed to apply changes"
            );
            if self.prompt.confirm(&names).await {
                self.coordinator
                    .terminate(|p| roots.iter().any(|r| Arc::ptr_eq(r, p)))
                    .await;
                return Ok(Some(LoopExit::RestartRoot));
            }
            return Ok(None);
        }

        match self
            .coordinator
            .handle_changes(self.engine, changes, self.prompt)
            .await?
        {
            ChangeOutcome::Restart { root, relaunch } => {
                if !relaunch.is_empty() {
                    let started = self.coordinator.relaunch(&relaunch).await?;
                    info!(count = started.len(), "Relaunched dependent processes");
                }
                if root == RootDecision::Restart {
                    return Ok(Some(LoopExit::RestartRoot));
                }
            }
            ChangeOutcome::NoChanges | ChangeOutcome::Blocked | ChangeOutcome::Applied { .. } => {}
        }

        Ok(None)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn any_exited(processes: &[Arc<RunningProcess>]) {
    if processes.is_empty() {
        return std::future::pending().await;
    }
    futures::future::select_all(processes.iter().map(|p| Box::pin(p.handle().wait()))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::QueuedEngine;
    use crate::engine::UpdateBatch;
    use crate::session::restart::tests::ScriptedInput;
    use crate::session::restart::RestartAnswer;
    use crate::session::testing::ScriptedClient;
    use crate::session::{ProcessHandle, ProcessOptions, ProcessState, UpdateClient};
    use crate::update::{ModuleId, Update};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            debounce_ms: 5,
            extended_debounce_ms: 15,
            ..SessionConfig::default()
        }
    }

    async fn session_with_root(
        capabilities: &str,
    ) -> (SessionCoordinator, Arc<ScriptedClient>, Arc<RunningProcess>) {
        let coordinator = SessionCoordinator::new(&config());
        let client = Arc::new(ScriptedClient::new(capabilities));
        let as_dyn: Arc<dyn UpdateClient> = client.clone();
        let options = ProcessOptions::new("/app", "app").root();
        let root = coordinator
            .track_new_process(as_dyn, options, ProcessHandle::detached())
            .await
            .unwrap()
            .unwrap();
        (coordinator, client, root)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_batches_are_normalized_and_applied() {
        let (coordinator, client, _root) = session_with_root("Baseline").await;
        let m = ModuleId::new_v4();
        let engine = QueuedEngine::new([UpdateBatch::ready(vec![Update::new(m)])]);
        let prompt = RestartPrompt::new(Box::new(ScriptedInput::new([])));
        let (tx, rx) = mpsc::channel(16);

        let run = HotReloadLoop::new(&coordinator, &engine, &prompt, &config())
            .with_project_dir("/app")
            .run(rx);
        let drive = async {
            tx.send(ChangeEvent::update("/app/a.rs")).await.unwrap();
            tx.send(ChangeEvent::update("/app/a.rs")).await.unwrap();
            wait_for(|| !client.received_modules().is_empty()).await;
            coordinator.shutdown_token().cancel();
        };

        let (exit, ()) = tokio::join!(run, drive);
        assert_eq!(exit.unwrap(), LoopExit::Shutdown);

        let requests = engine.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, vec![ChangeEvent::update("/app/a.rs")]);
        assert_eq!(client.received_modules(), vec![m]);
    }

    #[tokio::test]
    async fn test_transient_file_never_reaches_engine() {
        let (coordinator, _client, _root) = session_with_root("Baseline").await;
        let engine = QueuedEngine::default();
        let prompt = RestartPrompt::new(Box::new(ScriptedInput::new([])));
        let (tx, rx) = mpsc::channel(16);

        tx.send(ChangeEvent::add("/app/.tmp")).await.unwrap();
        tx.send(ChangeEvent::delete("/app/.tmp")).await.unwrap();
        drop(tx);

        let exit = HotReloadLoop::new(&coordinator, &engine, &prompt, &config())
            .run(rx)
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::WatcherClosed);
        assert!(engine.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_root_exit_ends_loop() {
        let (coordinator, _client, root) = session_with_root("Baseline").await;
        let engine = QueuedEngine::default();
        let prompt = RestartPrompt::new(Box::new(ScriptedInput::new([])));
        let (_tx, rx) = mpsc::channel(16);

        root.handle().mark_exited(0);
        let exit = HotReloadLoop::new(&coordinator, &engine, &prompt, &config())
            .run(rx)
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::RootExited);
    }

    #[tokio::test]
    async fn test_root_without_baseline_asks_for_restart() {
        let (coordinator, _client, root) = session_with_root("AddMethodToExistingType").await;
        let engine = QueuedEngine::default();
        let input = ScriptedInput::new([RestartAnswer::Yes]);
        let prompt = RestartPrompt::new(Box::new(input.clone()));
        let (tx, rx) = mpsc::channel(16);

        tx.send(ChangeEvent::update("/app/a.rs")).await.unwrap();
        let exit = HotReloadLoop::new(&coordinator, &engine, &prompt, &config())
            .run(rx)
            .await
            .unwrap();

        assert_eq!(exit, LoopExit::RestartRoot);
        assert_eq!(input.asked.lock().len(), 1);
        assert!(engine.requests.lock().is_empty());
        assert_eq!(root.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_rude_edit_on_root_restarts_it() {
        let m = ModuleId::new_v4();
        let coordinator = SessionCoordinator::new(&config());
        let client: Arc<dyn UpdateClient> = Arc::new(ScriptedClient::new("Baseline"));
        let root = coordinator
            .track_new_process(
                client,
                ProcessOptions::new("/app", "app").root().with_modules([m]),
                ProcessHandle::detached(),
            )
            .await
            .unwrap()
            .unwrap();

        let engine = QueuedEngine::new([UpdateBatch::restart(vec![m], vec![])]);
        let prompt = RestartPrompt::new(Box::new(ScriptedInput::new([RestartAnswer::Always])));
        let (tx, rx) = mpsc::channel(16);
        tx.send(ChangeEvent::update("/app/a.rs")).await.unwrap();

        let exit = HotReloadLoop::new(&coordinator, &engine, &prompt, &config())
            .run(rx)
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::RestartRoot);
        assert!(root.has_exited());
        assert_eq!(*engine.rebased.lock(), vec![m]);
    }
}
