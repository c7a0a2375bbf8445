//! Update clients: one per logical target, each owning its agent channel(s).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::protocol::{self, AgentResponse, LoggingLevel, ResponseType, UpdateResponse};
use super::reporter::ProcessReporter;
use super::running::CancelScope;
use crate::error::{CancelCause, ClientError, ProtocolError};
use crate::update::{Capabilities, ModuleId, StaticAsset, Update};

/// Result of applying one batch to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Failed,
    AllChangesApplied,
    SomeChangesApplied,
    NoChangesApplied,
}

impl ApplyStatus {
    /// Combine the statuses of several physical processes behind one target.
    ///
    /// Any failure dominates; otherwise all-applied only if every part says so,
    /// and nothing-applied only if no part applied anything.
    pub fn combine<I>(statuses: I) -> ApplyStatus
    where
        I: IntoIterator<Item = ApplyStatus>,
    {
        let mut all = true;
        let mut any = false;
        for status in statuses {
            match status {
                ApplyStatus::Failed => return ApplyStatus::Failed,
                ApplyStatus::AllChangesApplied => any = true,
                ApplyStatus::SomeChangesApplied => {
                    any = true;
                    all = false;
                }
                ApplyStatus::NoChangesApplied => all = false,
            }
        }

        match (any, all) {
            (true, true) => ApplyStatus::AllChangesApplied,
            (false, _) => ApplyStatus::NoChangesApplied,
            (true, false) => ApplyStatus::SomeChangesApplied,
        }
    }

    pub fn applied_any(self) -> bool {
        matches!(
            self,
            ApplyStatus::AllChangesApplied | ApplyStatus::SomeChangesApplied
        )
    }
}

/// One logical hot-reload target.
///
/// `apply` variants return `Err` only when the operation was cancelled; every
/// other failure is reported as [`ApplyStatus::Failed`].
#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Capabilities declared in the handshake.
    fn capabilities(&self) -> Capabilities;

    async fn apply(
        &self,
        updates: &[Arc<Update>],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause>;

    async fn apply_static_assets(
        &self,
        assets: &[StaticAsset],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause>;

    /// Release the process from its startup barrier once the backlog is applied.
    async fn initial_updates_completed(&self, scope: &CancelScope) -> Result<(), ClientError>;

    async fn dispose(&self);
}

/// Tracks modules a process will no longer be sent updates for.
#[derive(Default)]
pub struct UpdateFilter {
    frozen: Mutex<HashSet<ModuleId>>,
}

impl UpdateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates this process can take, in order.
    ///
    /// An update on a frozen module is dropped. An update needing a capability
    /// the process lacks freezes its module and is dropped; `on_freeze` is
    /// told which capabilities were missing.
    pub fn filter_applicable<F>(
        &self,
        updates: &[Arc<Update>],
        capabilities: &Capabilities,
        mut on_freeze: F,
    ) -> Vec<Arc<Update>>
    where
        F: FnMut(&Update, &[&str]),
    {
        let mut frozen = self.frozen.lock();
        let mut applicable = Vec::with_capacity(updates.len());

        for update in updates {
            if frozen.contains(&update.module_id) {
                continue;
            }

            let missing = capabilities.missing(&update.required_capabilities);
            if missing.is_empty() {
                applicable.push(Arc::clone(update));
            } else {
                frozen.insert(update.module_id);
                on_freeze(update, &missing);
            }
        }

        applicable
    }
}

fn unexpected(expected: ResponseType, actual: &AgentResponse) -> ClientError {
    ClientError::Protocol(ProtocolError::UnexpectedPayloadType {
        expected: expected as u8,
        actual: actual.payload_type() as u8,
    })
}

async fn read_handshake<S>(stream: &mut S) -> Result<Capabilities, ClientError>
where
    S: AsyncRead + Unpin,
{
    match protocol::read_response(stream).await? {
        AgentResponse::Handshake(capabilities) => Ok(capabilities),
        other => Err(unexpected(ResponseType::Handshake, &other)),
    }
}

/// Client for a single process reached over one byte channel.
pub struct PipeUpdateClient<S> {
    channel: tokio::sync::Mutex<S>,
    capabilities: Capabilities,
    filter: UpdateFilter,
    logging: LoggingLevel,
    reporter: ProcessReporter,
    failed: AtomicBool,
}

impl<S> PipeUpdateClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Take over a connected channel and read the process's capability handshake.
    pub async fn connect(
        mut stream: S,
        reporter: ProcessReporter,
        logging: LoggingLevel,
        scope: &CancelScope,
    ) -> Result<Self, ClientError> {
        let capabilities = tokio::select! {
            result = read_handshake(&mut stream) => result?,
            cause = scope.cancelled() => return Err(ClientError::Cancelled(cause)),
        };

        debug!(process = %reporter.name(), capabilities = %capabilities, "Capabilities");

        Ok(Self {
            channel: tokio::sync::Mutex::new(stream),
            capabilities,
            filter: UpdateFilter::new(),
            logging,
            reporter,
            failed: AtomicBool::new(false),
        })
    }

    pub fn filter_applicable(&self, updates: &[Arc<Update>]) -> Vec<Arc<Update>> {
        self.filter
            .filter_applicable(updates, &self.capabilities, |update, missing| {
                self.reporter.verbose(&format!(
                    "Module {} will not receive further updates: missing capabilities {}",
                    update.module_id,
                    missing.join(", ")
                ));
            })
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Send one request and wait for its response, strictly in that order.
    async fn exchange(&self, payload: &[u8]) -> Result<UpdateResponse, ClientError> {
        let mut channel = self.channel.lock().await;
        if self.is_failed() {
            return Err(ClientError::Unusable);
        }
        protocol::write_frame(&mut *channel, payload).await?;
        match protocol::read_response(&mut *channel).await? {
            AgentResponse::Update(response) => Ok(response),
            AgentResponse::Exception(e) => Err(ClientError::RuntimeRudeEdit {
                code: e.code,
                message: e.message,
            }),
            other => Err(unexpected(ResponseType::UpdateResponse, &other)),
        }
    }

    async fn round_trip(
        &self,
        payload: &[u8],
        scope: &CancelScope,
    ) -> Result<UpdateResponse, ClientError> {
        tokio::select! {
            result = self.exchange(payload) => result,
            cause = scope.cancelled() => Err(ClientError::Cancelled(cause)),
        }
    }

    async fn notify_initial_updates_completed(&self) -> Result<(), ClientError> {
        let mut channel = self.channel.lock().await;
        if self.is_failed() {
            return Err(ClientError::Unusable);
        }
        protocol::write_frame(&mut *channel, &protocol::encode_initial_updates_completed()).await
    }

    /// Run one exchange and fold its outcome into a status.
    async fn send(
        &self,
        payload: &[u8],
        scope: &CancelScope,
        applied: ApplyStatus,
    ) -> Result<ApplyStatus, CancelCause> {
        let result = self.round_trip(payload, scope).await.and_then(|response| {
            for entry in &response.log {
                self.reporter.agent_log(entry);
            }
            if response.success {
                Ok(())
            } else {
                Err(ClientError::Rejected)
            }
        });

        match result {
            Ok(()) => Ok(applied),
            Err(err) => {
                // the channel is retired after any failed exchange
                self.failed.store(true, Ordering::Release);
                match err {
                    ClientError::Cancelled(cause) => Err(cause),
                    ClientError::Unusable => Ok(ApplyStatus::Failed),
                    ClientError::RuntimeRudeEdit { code, message } => {
                        self.reporter.warning(&format!(
                            "Runtime rude edit detected (code {code}): {message}. \
                             Further changes won't be applied to this process"
                        ));
                        Ok(ApplyStatus::Failed)
                    }
                    err => {
                        self.reporter
                            .warning(&format!("Hot reload is no longer available: {err}"));
                        Ok(ApplyStatus::Failed)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<S> UpdateClient for PipeUpdateClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn apply(
        &self,
        updates: &[Arc<Update>],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        if self.is_failed() {
            return Ok(ApplyStatus::Failed);
        }

        let applicable = self.filter_applicable(updates);
        if applicable.is_empty() {
            return Ok(ApplyStatus::NoChangesApplied);
        }

        let applied = if applicable.len() == updates.len() {
            ApplyStatus::AllChangesApplied
        } else {
            ApplyStatus::SomeChangesApplied
        };

        let payload = protocol::encode_managed_code_update(
            applicable.iter().map(|u| u.as_ref()),
            self.logging,
        );
        debug!(process = %self.reporter.name(), count = applicable.len(), "Sending updates");
        self.send(&payload, scope, applied).await
    }

    async fn apply_static_assets(
        &self,
        assets: &[StaticAsset],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        if self.is_failed() {
            return Ok(ApplyStatus::Failed);
        }
        if assets.is_empty() {
            return Ok(ApplyStatus::NoChangesApplied);
        }

        for asset in assets {
            let payload = protocol::encode_static_asset_update(asset, self.logging);
            debug!(
                process = %self.reporter.name(),
                path = %asset.relative_path,
                "Sending static asset"
            );
            let status = self.send(&payload, scope, ApplyStatus::AllChangesApplied).await?;
            if status == ApplyStatus::Failed {
                return Ok(ApplyStatus::Failed);
            }
        }

        Ok(ApplyStatus::AllChangesApplied)
    }

    async fn initial_updates_completed(&self, scope: &CancelScope) -> Result<(), ClientError> {
        let result = tokio::select! {
            result = self.notify_initial_updates_completed() => result,
            cause = scope.cancelled() => Err(ClientError::Cancelled(cause)),
        };

        if result.is_err() {
            self.failed.store(true, Ordering::Release);
        }
        result
    }

    async fn dispose(&self) {
        self.failed.store(true, Ordering::Release);
        // an exchange still in flight ends with the process
        if let Ok(mut channel) = self.channel.try_lock() {
            if let Err(e) = channel.shutdown().await {
                debug!(process = %self.reporter.name(), "Channel shutdown: {}", e);
            }
        }
    }
}

/// A target made of two processes that must both take every update,
/// such as a browser-hosted client and the server hosting it.
pub struct HostedUpdateClient {
    client: Arc<dyn UpdateClient>,
    host: Arc<dyn UpdateClient>,
}

impl HostedUpdateClient {
    pub fn new(client: Arc<dyn UpdateClient>, host: Arc<dyn UpdateClient>) -> Self {
        Self { client, host }
    }
}

fn join_cancelled(
    a: Result<ApplyStatus, CancelCause>,
    b: Result<ApplyStatus, CancelCause>,
) -> Result<ApplyStatus, CancelCause> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok(ApplyStatus::combine([a, b])),
        (Err(CancelCause::Shutdown), _) | (_, Err(CancelCause::Shutdown)) => {
            Err(CancelCause::Shutdown)
        }
        (Err(cause), _) | (_, Err(cause)) => Err(cause),
    }
}

#[async_trait]
impl UpdateClient for HostedUpdateClient {
    /// Only what both sides support is worth producing.
    fn capabilities(&self) -> Capabilities {
        self.client.capabilities().intersection(&self.host.capabilities())
    }

    async fn apply(
        &self,
        updates: &[Arc<Update>],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        let (client, host) = futures::join!(
            self.client.apply(updates, scope),
            self.host.apply(updates, scope)
        );
        join_cancelled(client, host)
    }

    async fn apply_static_assets(
        &self,
        assets: &[StaticAsset],
        scope: &CancelScope,
    ) -> Result<ApplyStatus, CancelCause> {
        let (client, host) = futures::join!(
            self.client.apply_static_assets(assets, scope),
            self.host.apply_static_assets(assets, scope)
        );
        join_cancelled(client, host)
    }

    async fn initial_updates_completed(&self, scope: &CancelScope) -> Result<(), ClientError> {
        let (client, host) = futures::join!(
            self.client.initial_updates_completed(scope),
            self.host.initial_updates_completed(scope)
        );
        client.and(host)
    }

    async fn dispose(&self) {
        futures::join!(self.client.dispose(), self.host.dispose());
    }
}

/// Log and swallow a cancellation caused by the process's own exit.
pub(crate) fn report_cancelled(reporter: &ProcessReporter, cause: CancelCause, what: &str) {
    match cause {
        CancelCause::ProcessExited => {
            reporter.verbose(&format!("{what} cancelled: process exited"))
        }
        CancelCause::Shutdown => warn!(process = %reporter.name(), "{} cancelled: {}", what, cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::{AgentRequest, AgentSeverity, HotReloadException, LogEntry};
    use crate::session::testing::{self, Reply};
    use tokio_util::sync::CancellationToken;

    fn update(module: ModuleId, caps: &[&str]) -> Arc<Update> {
        Arc::new(
            Update::new(module)
                .with_deltas(vec![1], vec![2], vec![3])
                .requiring(caps.iter().copied()),
        )
    }

    #[test]
    fn test_combine_statuses() {
        use ApplyStatus::*;
        assert_eq!(ApplyStatus::combine([Failed, AllChangesApplied]), Failed);
        assert_eq!(
            ApplyStatus::combine([AllChangesApplied, AllChangesApplied]),
            AllChangesApplied
        );
        assert_eq!(
            ApplyStatus::combine([NoChangesApplied, SomeChangesApplied]),
            SomeChangesApplied
        );
        assert_eq!(
            ApplyStatus::combine([AllChangesApplied, NoChangesApplied]),
            SomeChangesApplied
        );
        assert_eq!(
            ApplyStatus::combine([NoChangesApplied, NoChangesApplied]),
            NoChangesApplied
        );
        assert_eq!(ApplyStatus::combine(std::iter::empty()), NoChangesApplied);
    }

    #[test]
    fn test_frozen_module_stays_frozen() {
        let filter = UpdateFilter::new();
        let caps = Capabilities::parse("A");
        let m = ModuleId::new_v4();
        let other = ModuleId::new_v4();

        let mut frozen = Vec::new();
        let kept = filter.filter_applicable(
            &[update(m, &["A", "B"]), update(other, &["A"])],
            &caps,
            |u, missing| frozen.push((u.module_id, missing.join(","))),
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].module_id, other);
        assert_eq!(frozen, vec![(m, "B".to_string())]);

        // satisfiable now, but the module is frozen for good
        let kept = filter.filter_applicable(&[update(m, &["A"])], &caps, |_, _| {
            panic!("already frozen modules are not re-reported")
        });
        assert!(kept.is_empty());
        let kept = filter.filter_applicable(&[update(other, &["A"])], &caps, |_, _| {});
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_capabilities_are_cached() {
        let (client, agent) = testing::connect_pipe_client("Baseline A", Reply::Accept).await;
        assert_eq!(client.capabilities(), Capabilities::parse("A Baseline"));
        drop(client);
        assert!(agent.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_filtered_batch_sends_nothing() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Accept).await;
        let scope = testing::scope();

        let status = client
            .apply(&[update(ModuleId::new_v4(), &["B"])], &scope)
            .await;
        assert_eq!(status, Ok(ApplyStatus::NoChangesApplied));

        drop(client);
        assert!(agent.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_is_some_changes_applied() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Accept).await;
        let scope = testing::scope();
        let keep = ModuleId::new_v4();

        let status = client
            .apply(&[update(keep, &["A"]), update(ModuleId::new_v4(), &["B"])], &scope)
            .await;
        assert_eq!(status, Ok(ApplyStatus::SomeChangesApplied));

        drop(client);
        let requests = agent.finish().await;
        match requests.as_slice() {
            [AgentRequest::ManagedCodeUpdate { updates, .. }] => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].module_id, keep);
            }
            other => panic!("unexpected requests: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_makes_client_unusable() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Reject).await;
        let scope = testing::scope();
        let m = ModuleId::new_v4();

        assert_eq!(
            client.apply(&[update(m, &["A"])], &scope).await,
            Ok(ApplyStatus::Failed)
        );
        assert!(client.is_failed());

        // no further I/O: the agent sees exactly one request
        for _ in 0..3 {
            assert_eq!(
                client.apply(&[update(m, &["A"])], &scope).await,
                Ok(ApplyStatus::Failed)
            );
        }
        let asset = StaticAsset {
            assembly_name: "App".into(),
            is_application_asset: true,
            relative_path: "site.css".into(),
            contents: vec![],
        };
        assert_eq!(
            client.apply_static_assets(&[asset], &scope).await,
            Ok(ApplyStatus::Failed)
        );

        drop(client);
        assert_eq!(agent.finish().await.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_fails() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Hangup).await;
        let scope = testing::scope();

        let status = client
            .apply(&[update(ModuleId::new_v4(), &["A"])], &scope)
            .await;
        assert_eq!(status, Ok(ApplyStatus::Failed));
        agent.finish().await;
    }

    #[tokio::test]
    async fn test_runtime_rude_edit_fails_the_batch() {
        let exception = HotReloadException {
            code: 7,
            message: "field added to a struct".into(),
        };
        let (client, agent) =
            testing::connect_pipe_client("A", Reply::Exception(exception)).await;
        let scope = testing::scope();

        let status = client
            .apply(&[update(ModuleId::new_v4(), &["A"])], &scope)
            .await;
        assert_eq!(status, Ok(ApplyStatus::Failed));
        assert!(client.is_failed());

        let reported = agent.reporter().tail(1);
        assert_eq!(reported.len(), 1);
        assert!(reported[0].starts_with("Runtime rude edit detected (code 7): field added"));

        drop(client);
        assert_eq!(agent.finish().await.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_log_forwarded_to_reporter() {
        let log = vec![
            LogEntry::new(AgentSeverity::Verbose, "applied delta"),
            LogEntry::new(AgentSeverity::Warning, "slow apply"),
        ];
        let (client, agent) = testing::connect_pipe_client("A", Reply::AcceptWithLog(log)).await;
        let scope = testing::scope();

        let status = client
            .apply(&[update(ModuleId::new_v4(), &["A"])], &scope)
            .await;
        assert_eq!(status, Ok(ApplyStatus::AllChangesApplied));
        assert_eq!(
            agent.reporter().tail(2),
            vec!["[agent] applied delta", "[agent] slow apply"]
        );
        drop(client);
        agent.finish().await;
    }

    #[tokio::test]
    async fn test_cancel_on_exit_is_reported_as_cause() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Silent).await;
        let exited = CancellationToken::new();
        let scope = CancelScope::new(CancellationToken::new(), exited.clone());

        let batch = [update(ModuleId::new_v4(), &["A"])];
        let apply = client.apply(&batch, &scope);
        let (status, ()) = tokio::join!(apply, async {
            tokio::task::yield_now().await;
            exited.cancel();
        });

        assert_eq!(status, Err(CancelCause::ProcessExited));
        assert!(client.is_failed());
        drop(client);
        agent.finish().await;
    }

    #[tokio::test]
    async fn test_initial_updates_completed_is_one_way() {
        let (client, agent) = testing::connect_pipe_client("A", Reply::Accept).await;
        client
            .initial_updates_completed(&testing::scope())
            .await
            .unwrap();
        drop(client);
        assert_eq!(
            agent.finish().await,
            vec![AgentRequest::InitialUpdatesCompleted]
        );
    }

    #[tokio::test]
    async fn test_hosted_client_intersects_and_combines() {
        let (client, client_agent) = testing::connect_pipe_client("A B", Reply::Accept).await;
        let (host, host_agent) = testing::connect_pipe_client("A", Reply::Accept).await;
        let hosted = HostedUpdateClient::new(Arc::new(client), Arc::new(host));
        let scope = testing::scope();

        assert_eq!(hosted.capabilities(), Capabilities::parse("A"));

        let status = hosted
            .apply(&[update(ModuleId::new_v4(), &["B"])], &scope)
            .await;
        // the client side applies it, the host side cannot
        assert_eq!(status, Ok(ApplyStatus::SomeChangesApplied));

        drop(hosted);
        assert_eq!(client_agent.finish().await.len(), 1);
        assert!(host_agent.finish().await.is_empty());
    }
}
