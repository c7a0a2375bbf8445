//! In-memory agents and clients for exercising the session without real processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::{ApplyStatus, PipeUpdateClient, UpdateClient};
use super::log_buffer::LogBuffer;
use super::protocol::{
    self, AgentRequest, HotReloadException, LogEntry, LoggingLevel, UpdateResponse,
};
use super::reporter::ProcessReporter;
use super::running::CancelScope;
use crate::error::{CancelCause, ClientError};
use crate::update::{Capabilities, ModuleId, StaticAsset, Update};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the fake agent answers update requests.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Accept,
    AcceptWithLog(Vec<LogEntry>),
    Reject,
    /// Report a runtime rude edit instead of an update response.
    Exception(HotReloadException),
    /// Drop the channel on the first update request.
    Hangup,
    /// Read requests but never answer.
    Silent,
}

pub(crate) fn scope() -> CancelScope {
    CancelScope::new(CancellationToken::new(), CancellationToken::new())
}

pub(crate) fn reporter(name: &str) -> ProcessReporter {
    ProcessReporter::new(name, Arc::new(LogBuffer::new(100)))
}

pub(crate) struct FakeAgent {
    task: JoinHandle<Vec<AgentRequest>>,
    reporter: ProcessReporter,
}

impl FakeAgent {
    /// Start an agent that handshakes with `capabilities` and answers with `reply`.
    pub(crate) fn spawn(
        capabilities: &str,
        reply: Reply,
    ) -> (DuplexStream, JoinHandle<Vec<AgentRequest>>) {
        let (ours, mut theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let capabilities = Capabilities::parse(capabilities);

        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            if protocol::write_frame(&mut theirs, &protocol::encode_handshake(&capabilities))
                .await
                .is_err()
            {
                return seen;
            }

            while let Ok(request) = protocol::read_request(&mut theirs).await {
                let needs_reply = !matches!(request, AgentRequest::InitialUpdatesCompleted);
                seen.push(request);
                if !needs_reply {
                    continue;
                }

                let respond = |success, log| {
                    protocol::encode_update_response(&UpdateResponse { success, log })
                };
                let payload = match &reply {
                    Reply::Accept => respond(true, vec![]),
                    Reply::AcceptWithLog(log) => respond(true, log.clone()),
                    Reply::Reject => respond(false, vec![]),
                    Reply::Exception(exception) => protocol::encode_hot_reload_exception(exception),
                    Reply::Hangup => break,
                    Reply::Silent => continue,
                };

                if protocol::write_frame(&mut theirs, &payload).await.is_err() {
                    break;
                }
            }
            seen
        });

        (ours, task)
    }

    pub(crate) fn reporter(&self) -> &ProcessReporter {
        &self.reporter
    }

    /// Wait for the channel to close and return every request the agent saw.
    pub(crate) async fn finish(self) -> Vec<AgentRequest> {
        self.task.await.unwrap_or_default()
    }
}

/// A pipe client connected to a fresh fake agent.
pub(crate) async fn connect_pipe_client(
    capabilities: &str,
    reply: Reply,
) -> (PipeUpdateClient<DuplexStream>, FakeAgent) {
    let (stream, task) = FakeAgent::spawn(capabilities, reply);
    let reporter = reporter("agent");
    let client =
        PipeUpdateClient::connect(stream, reporter.clone(), LoggingLevel::Verbose, &scope())
            .await
            .unwrap();
    (client, FakeAgent { task, reporter })
}

/// Lets a test hold a client inside its first `apply`.
pub(crate) struct GateControl {
    pub(crate) entered: oneshot::Receiver<()>,
    pub(crate) release: oneshot::Sender<()>,
}

struct Gate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// A client that accepts everything and records what it was sent.
pub(crate) struct ScriptedClient {
    capabilities: Capabilities,
    received: Mutex<Vec<Arc<Update>>>,
    assets: Mutex<Vec<StaticAsset>>,
    gate: Mutex<Option<Gate>>,
    completed: AtomicBool,
    disposed: AtomicBool,
}

impl ScriptedClient {
    pub(crate) fn new(capabilities: &str) -> Self {
        Self {
            capabilities: Capabilities::parse(capabilities),
            received: Mutex::new(Vec::new()),
            assets: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn gated(capabilities: &str) -> (Self, GateControl) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let client = Self::new(capabilities);
        *client.gate.lock() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (
            client,
            GateControl {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    pub(crate) fn received_modules(&self) -> Vec<ModuleId> {
        self.received.lock().iter().map(|u| u.module_id).collect()
    }

    pub(crate) fn received_assets(&self) -> Vec<String> {
        self.assets
            .lock()
            .iter()
            .map(|a| a.relative_path.clone())
            .collect()
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl UpdateClient for ScriptedClient {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn apply(
        &self,
        updates: &[Arc<Update>],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            tokio::select! {
                _ = gate.release => {}
                cause = scope.cancelled() => return Err(cause),
            }
        }

        if let Some(cause) = scope.cause() {
            return Err(cause);
        }
        if updates.is_empty() {
            return Ok(ApplyStatus::NoChangesApplied);
        }
        self.received.lock().extend(updates.iter().cloned());
        Ok(ApplyStatus::AllChangesApplied)
    }

    async fn apply_static_assets(
        &self,
        assets: &[StaticAsset],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        if let Some(cause) = scope.cause() {
            return Err(cause);
        }
        if assets.is_empty() {
            return Ok(ApplyStatus::NoChangesApplied);
        }
        self.assets.lock().extend(assets.iter().cloned());
        Ok(ApplyStatus::AllChangesApplied)
    }

    async fn initial_updates_completed(&self, scope: &CancelScope) -> Result<(), ClientError> {
        if let Some(cause) = scope.cause() {
            return Err(ClientError::Cancelled(cause));
        }
        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}
