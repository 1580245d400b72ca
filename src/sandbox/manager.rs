//! Registry of sandboxes and the operations callers run against them.
//!
//! Each entry owns its backend handle and its agent session. Operations on
//! one sandbox serialize through the session state machine; sandboxes are
//! otherwise fully independent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tokio::sync::RwLock;

use super::backend::{AllocateRequest, SandboxBackend};
use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::*;
use crate::protocol::{AgentProtocolClient, EventStream, ProtocolEvent, SessionState};
use crate::storage::layout::validate_identifier;
use crate::storage::snapshot::SnapshotManager;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Runtime {
    handle: Box<dyn SandboxHandle>,
    client: AgentProtocolClient,
}

struct SandboxEntry {
    info: Mutex<SandboxInfo>,
    runtime: RwLock<Option<Runtime>>,
}

impl SandboxEntry {
    fn info(&self) -> SandboxInfo {
        lock(&self.info).clone()
    }

    fn id(&self) -> SandboxId {
        lock(&self.info).sandbox_id.clone()
    }

    fn status(&self) -> SandboxStatus {
        lock(&self.info).status
    }

    fn set_status(&self, status: SandboxStatus) {
        lock(&self.info).status = status;
    }

    fn not_active(&self) -> SandboxError {
        let info = lock(&self.info);
        SandboxError::NotActive {
            id: info.sandbox_id.clone(),
            status: info.status,
        }
    }

    /// Record activity. An idle sandbox becomes active again.
    fn touch(&self) {
        let mut info = lock(&self.info);
        info.last_heartbeat = Utc::now();
        if info.status == SandboxStatus::Idle {
            info.status = SandboxStatus::Active;
        }
    }

    /// Mark a live sandbox `Failed`. Terminal statuses are left alone.
    fn fail(&self, reason: &str) {
        let mut info = lock(&self.info);
        if matches!(
            info.status,
            SandboxStatus::Active | SandboxStatus::Idle | SandboxStatus::Snapshotting
        ) {
            tracing::error!(sandbox_id = %info.sandbox_id, reason, "sandbox failed");
            info.status = SandboxStatus::Failed;
        }
    }

    /// Enter `Snapshotting`, returning the status to go back to.
    fn begin_snapshot(&self) -> Result<SandboxStatus, SandboxError> {
        let mut info = lock(&self.info);
        match info.status {
            SandboxStatus::Active | SandboxStatus::Idle => {
                let previous = info.status;
                info.status = SandboxStatus::Snapshotting;
                Ok(previous)
            }
            SandboxStatus::Snapshotting => Err(SandboxError::Busy(info.sandbox_id.clone())),
            status => Err(SandboxError::NotActive {
                id: info.sandbox_id.clone(),
                status,
            }),
        }
    }
}

/// Puts a sandbox back to its pre-snapshot status when dropped.
struct SnapshotStatus<'a> {
    entry: &'a SandboxEntry,
    previous: SandboxStatus,
}

impl Drop for SnapshotStatus<'_> {
    fn drop(&mut self) {
        let mut info = lock(&self.entry.info);
        if info.status == SandboxStatus::Snapshotting {
            info.status = self.previous;
        }
    }
}

/// Owns partially provisioned resources. Dropped while armed (caller
/// cancelled `provision`), it marks the entry `Failed` and releases the
/// backend handle in the background.
struct ProvisionGuard {
    entry: Arc<SandboxEntry>,
    handle: Option<Box<dyn SandboxHandle>>,
    client: Option<AgentProtocolClient>,
    armed: bool,
}

impl ProvisionGuard {
    fn new(entry: Arc<SandboxEntry>) -> Self {
        Self {
            entry,
            handle: None,
            client: None,
            armed: true,
        }
    }

    fn disarm(mut self) -> Option<Runtime> {
        self.armed = false;
        Some(Runtime {
            handle: self.handle.take()?,
            client: self.client.take()?,
        })
    }

    /// Undo everything allocated so far. Failures are logged only.
    async fn rollback(mut self) {
        self.armed = false;
        self.entry.set_status(SandboxStatus::Failed);
        if let Some(mut client) = self.client.take() {
            client.close().await;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release().await {
                tracing::warn!(sandbox_id = %self.entry.id(), error = %e, "rollback failed");
            }
        }
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sandbox_id = self.entry.id();
        tracing::warn!(sandbox_id = %sandbox_id, "provision cancelled, rolling back");
        self.entry.set_status(SandboxStatus::Failed);
        drop(self.client.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = handle.release().await {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "rollback failed");
                    }
                });
            }
            Err(_) => tracing::warn!(sandbox_id = %sandbox_id, "no runtime to release sandbox"),
        }
    }
}

/// Orchestration entry point: one instance per orchestrator.
pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    snapshots: SnapshotManager,
    timeouts: ProtocolTimeouts,
    sandboxes: RwLock<BTreeMap<SandboxId, Arc<SandboxEntry>>>,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        snapshots: SnapshotManager,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        Self {
            backend,
            snapshots,
            timeouts,
            sandboxes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    async fn entry(&self, sandbox_id: &str) -> Result<Arc<SandboxEntry>, SandboxError> {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Allocate a sandbox, start its agent and complete the handshake.
    ///
    /// Any failure after the id is allocated is a `Provision` error wrapping
    /// the cause; the entry stays registered as `Failed` and everything
    /// allocated for it is released first.
    pub async fn provision(
        &self,
        tenant_id: &str,
        user_id: &str,
        llm: &LlmProviderConfig,
    ) -> Result<SandboxInfo, SandboxError> {
        validate_identifier(tenant_id)?;
        validate_identifier(user_id)?;

        let sandbox_id = new_sandbox_id();
        let location = self.backend.location_for(tenant_id, &sandbox_id)?;
        let now = Utc::now();
        let entry = Arc::new(SandboxEntry {
            info: Mutex::new(SandboxInfo {
                sandbox_id: sandbox_id.clone(),
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                backend: self.backend.kind(),
                location,
                status: SandboxStatus::Provisioning,
                created_at: now,
                last_heartbeat: now,
            }),
            runtime: RwLock::new(None),
        });
        self.sandboxes
            .write()
            .await
            .insert(sandbox_id.clone(), entry.clone());

        tracing::info!(
            sandbox_id = %sandbox_id,
            tenant_id,
            user_id,
            backend = %self.backend.kind(),
            "provisioning sandbox"
        );

        let request = AllocateRequest {
            sandbox_id: sandbox_id.clone(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
        };
        let mut guard = ProvisionGuard::new(entry.clone());
        if let Err(e) = self.bring_up(&mut guard, &request, llm).await {
            tracing::error!(sandbox_id = %sandbox_id, error = %e, "provisioning failed");
            guard.rollback().await;
            return Err(SandboxError::Provision {
                sandbox_id,
                source: Box::new(e),
            });
        }

        let mut slot = entry.runtime.write().await;
        if entry.status() != SandboxStatus::Provisioning {
            // Torn down while the handshake was running.
            let cause = entry.not_active();
            drop(slot);
            guard.rollback().await;
            entry.set_status(SandboxStatus::Terminated);
            return Err(SandboxError::Provision {
                sandbox_id,
                source: Box::new(cause),
            });
        }
        *slot = guard.disarm();
        drop(slot);

        let mut info = lock(&entry.info);
        info.status = SandboxStatus::Active;
        info.last_heartbeat = Utc::now();
        tracing::info!(sandbox_id = %sandbox_id, location = %info.location, "sandbox active");
        Ok(info.clone())
    }

    async fn bring_up(
        &self,
        guard: &mut ProvisionGuard,
        request: &AllocateRequest,
        llm: &LlmProviderConfig,
    ) -> Result<(), SandboxError> {
        let handle = guard.handle.insert(self.backend.allocate(request).await?);
        let transport = handle.launch_agent(llm).await?;
        let cwd = handle.agent_cwd();
        let client = guard
            .client
            .insert(AgentProtocolClient::new(transport, self.timeouts));
        client.handshake(&cwd).await?;
        Ok(())
    }

    /// Stop the agent and release the sandbox. Repeated calls are no-ops.
    pub async fn teardown(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        if entry.status() == SandboxStatus::Terminated {
            return Ok(());
        }

        let runtime = entry.runtime.write().await.take();
        let released = match runtime {
            Some(mut rt) => {
                rt.client.close().await;
                rt.handle.release().await
            }
            None => Ok(()),
        };
        entry.set_status(SandboxStatus::Terminated);

        match &released {
            Ok(()) => tracing::info!(sandbox_id, "sandbox terminated"),
            Err(e) => tracing::warn!(sandbox_id, error = %e, "sandbox terminated with errors"),
        }
        released
    }

    /// Tear down every sandbox.
    pub async fn shutdown(&self) {
        let ids: Vec<SandboxId> = self.sandboxes.read().await.keys().cloned().collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.teardown(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(sandbox_id = %id, error = %e, "teardown during shutdown failed");
            }
        }
    }

    // ── Conversation ────────────────────────────────────────────

    /// Send one instruction to the sandbox's agent.
    ///
    /// Fails fast with `Busy` while a previous message is still streaming or
    /// a snapshot is running.
    pub async fn send_message(
        &self,
        sandbox_id: &str,
        text: &str,
    ) -> Result<MessageStream, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        match entry.status() {
            SandboxStatus::Active | SandboxStatus::Idle => {}
            SandboxStatus::Snapshotting => return Err(SandboxError::Busy(sandbox_id.to_string())),
            _ => return Err(entry.not_active()),
        }

        let runtime = entry.runtime.read().await;
        let Some(rt) = runtime.as_ref() else {
            return Err(entry.not_active());
        };
        let events = match rt.client.send_message(text).await {
            Ok(events) => events,
            Err(SandboxError::Busy(_)) => return Err(SandboxError::Busy(sandbox_id.to_string())),
            Err(SandboxError::SessionNotReady(state)) => {
                if state == SessionState::Stopped.as_str() {
                    entry.fail("agent session stopped");
                }
                return Err(entry.not_active());
            }
            Err(e) => return Err(e),
        };
        drop(runtime);

        entry.touch();
        tracing::debug!(sandbox_id, request_id = events.request_id(), "message sent");
        Ok(MessageStream {
            inner: events,
            entry,
        })
    }

    // ── Files ───────────────────────────────────────────────────

    pub async fn list_files(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FilesystemEntry>, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        if !matches!(
            entry.status(),
            SandboxStatus::Active | SandboxStatus::Idle | SandboxStatus::Snapshotting
        ) {
            return Err(entry.not_active());
        }
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        rt.handle.list_files(path).await
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Bytes, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        if !matches!(
            entry.status(),
            SandboxStatus::Active | SandboxStatus::Idle | SandboxStatus::Snapshotting
        ) {
            return Err(entry.not_active());
        }
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        rt.handle.read_file(path).await
    }

    /// Save an uploaded file into the workspace's attachments directory.
    /// Refused while a snapshot is being taken.
    pub async fn upload_file(
        &self,
        sandbox_id: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<String, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        match entry.status() {
            SandboxStatus::Active | SandboxStatus::Idle => {}
            SandboxStatus::Snapshotting => return Err(SandboxError::Busy(sandbox_id.to_string())),
            _ => return Err(entry.not_active()),
        }
        let saved = rt.handle.upload_file(filename, data).await?;
        entry.touch();
        Ok(saved)
    }

    pub async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<bool, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        match entry.status() {
            SandboxStatus::Active | SandboxStatus::Idle => {}
            SandboxStatus::Snapshotting => return Err(SandboxError::Busy(sandbox_id.to_string())),
            _ => return Err(entry.not_active()),
        }
        let deleted = rt.handle.delete_file(path).await?;
        entry.touch();
        Ok(deleted)
    }

    // ── Snapshots ───────────────────────────────────────────────

    /// Archive the sandbox's workspace. The caller persists the record.
    pub async fn create_snapshot(&self, sandbox_id: &str) -> Result<SnapshotRecord, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        let previous = entry.begin_snapshot()?;
        let _status = SnapshotStatus {
            entry: &entry,
            previous,
        };
        if rt.client.state() == SessionState::Streaming {
            return Err(SandboxError::Busy(sandbox_id.to_string()));
        }

        match rt.handle.create_snapshot(&self.snapshots).await {
            Ok(result) => Ok(SnapshotRecord::from_result(sandbox_id, result)),
            Err(e) => {
                tracing::warn!(sandbox_id, error = %e, "snapshot failed");
                Err(e)
            }
        }
    }

    /// Replace the sandbox's workspace with a snapshot of the same tenant.
    pub async fn restore_snapshot(
        &self,
        sandbox_id: &str,
        storage_path: &str,
        overwrite: bool,
    ) -> Result<(), SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let runtime = entry.runtime.read().await;
        let rt = runtime.as_ref().ok_or_else(|| entry.not_active())?;
        let previous = entry.begin_snapshot()?;
        let _status = SnapshotStatus {
            entry: &entry,
            previous,
        };
        if rt.client.state() == SessionState::Streaming {
            return Err(SandboxError::Busy(sandbox_id.to_string()));
        }

        rt.handle
            .restore_snapshot(&self.snapshots, storage_path, overwrite)
            .await
            .inspect_err(|e| tracing::warn!(sandbox_id, error = %e, "restore failed"))
    }

    pub async fn list_snapshots(&self, sandbox_id: &str) -> Result<Vec<String>, SandboxError> {
        let info = self.get(sandbox_id).await?;
        self.snapshots
            .list_snapshots(&info.tenant_id, &info.sandbox_id)
            .await
    }

    // ── Liveness ────────────────────────────────────────────────

    pub async fn heartbeat(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        if !matches!(
            entry.status(),
            SandboxStatus::Active | SandboxStatus::Idle | SandboxStatus::Snapshotting
        ) {
            return Err(entry.not_active());
        }
        entry.touch();
        Ok(())
    }

    /// Flag an active sandbox as idle. The next message reactivates it.
    pub async fn mark_idle(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let mut info = lock(&entry.info);
        match info.status {
            SandboxStatus::Active | SandboxStatus::Idle => {
                info.status = SandboxStatus::Idle;
                Ok(())
            }
            status => Err(SandboxError::NotActive {
                id: info.sandbox_id.clone(),
                status,
            }),
        }
    }

    /// Live sandboxes whose last heartbeat is older than `window`.
    pub async fn stale_sandboxes(&self, window: Duration) -> Vec<SandboxInfo> {
        let Some(cutoff) = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
        else {
            return Vec::new();
        };
        self.list()
            .await
            .into_iter()
            .filter(|info| info.status.is_live() && info.last_heartbeat < cutoff)
            .collect()
    }

    /// Whether the sandbox's agent is still running.
    pub async fn is_alive(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        let runtime = entry.runtime.read().await;
        Ok(match runtime.as_ref() {
            Some(rt) => rt.client.state() != SessionState::Stopped && rt.handle.is_alive().await,
            None => false,
        })
    }

    // ── Queries ─────────────────────────────────────────────────

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        let entry = self.entry(sandbox_id).await?;
        if let Ok(runtime) = entry.runtime.try_read() {
            if let Some(rt) = runtime.as_ref() {
                if rt.client.state() == SessionState::Stopped {
                    entry.fail("agent session stopped");
                }
            }
        }
        Ok(entry.info())
    }

    /// All known sandboxes, oldest first.
    pub async fn list(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }
}

/// Events of one message. Ends after exactly one terminal item; a session
/// that cannot continue marks the sandbox `Failed`.
pub struct MessageStream {
    inner: EventStream,
    entry: Arc<SandboxEntry>,
}

impl MessageStream {
    pub async fn next_event(&mut self) -> Option<Result<ProtocolEvent, SandboxError>> {
        let item = self.inner.next_event().await?;
        let fatal = match &item {
            Err(e) => e.is_fatal_to_session(),
            Ok(event) => event.is_terminal() && self.inner.session_state() == SessionState::Stopped,
        };
        if fatal {
            self.entry.fail("agent session ended");
        } else {
            self.entry.touch();
        }
        Some(item)
    }

    /// Stop consuming and ask the agent to cancel. The sandbox stays usable.
    pub async fn cancel(self) {
        self.inner.cancel().await;
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ProtocolEvent, SandboxError>> + Send {
        async_stream::stream! {
            let mut events = self;
            while let Some(item) = events.next_event().await {
                yield item;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::kubernetes::KubernetesBackend;
    use crate::sandbox::kubernetes::transport::testing::FakeCluster;
    use crate::storage::object_store::LocalDiskStore;
    use async_trait::async_trait;
    use futures::StreamExt;

    fn snapshots(tmp: &tempfile::TempDir) -> SnapshotManager {
        SnapshotManager::new(Arc::new(
            LocalDiskStore::new(tmp.path().join("store")).unwrap(),
        ))
    }

    fn llm() -> LlmProviderConfig {
        LlmProviderConfig::new("anthropic", "claude-sonnet-4-5")
    }

    fn pod_manager(tmp: &tempfile::TempDir, cluster: Arc<FakeCluster>) -> SandboxManager {
        let backend = KubernetesBackend::new(
            KubernetesConfig::default(),
            AgentLaunchConfig::default(),
            cluster,
        );
        SandboxManager::new(Arc::new(backend), snapshots(tmp), ProtocolTimeouts::default())
    }

    /// Allocates handles whose agent never answers.
    struct SilentBackend {
        released: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct SilentHandle {
        location: SandboxLocation,
        agent: Option<tokio::io::DuplexStream>,
        released: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl SandboxBackend for SilentBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        fn location_for(&self, _: &str, sandbox_id: &str) -> Result<SandboxLocation, SandboxError> {
            Ok(SandboxLocation::Directory {
                path: format!("/silent/{sandbox_id}").into(),
            })
        }

        async fn allocate(
            &self,
            req: &AllocateRequest,
        ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            Ok(Box::new(SilentHandle {
                location: self.location_for(&req.tenant_id, &req.sandbox_id)?,
                agent: None,
                released: self.released.clone(),
            }))
        }
    }

    #[async_trait]
    impl SandboxHandle for SilentHandle {
        fn location(&self) -> &SandboxLocation {
            &self.location
        }

        fn agent_cwd(&self) -> String {
            self.location.to_string()
        }

        async fn launch_agent(
            &mut self,
            _: &LlmProviderConfig,
        ) -> Result<crate::protocol::AgentTransport, SandboxError> {
            let (transport, agent) = crate::protocol::AgentTransport::pair(1024);
            self.agent = Some(agent);
            Ok(transport)
        }

        async fn is_alive(&self) -> bool {
            self.agent.is_some()
        }

        async fn list_files(&self, _: &str) -> Result<Vec<FilesystemEntry>, SandboxError> {
            Err(SandboxError::Unsupported("list_files"))
        }

        async fn read_file(&self, _: &str) -> Result<Bytes, SandboxError> {
            Err(SandboxError::Unsupported("read_file"))
        }

        async fn upload_file(&self, _: &str, _: Bytes) -> Result<String, SandboxError> {
            Err(SandboxError::Unsupported("upload_file"))
        }

        async fn delete_file(&self, _: &str) -> Result<bool, SandboxError> {
            Err(SandboxError::Unsupported("delete_file"))
        }

        async fn create_snapshot(
            &self,
            _: &SnapshotManager,
        ) -> Result<SnapshotResult, SandboxError> {
            Err(SandboxError::Unsupported("create_snapshot"))
        }

        async fn restore_snapshot(
            &self,
            _: &SnapshotManager,
            _: &str,
            _: bool,
        ) -> Result<(), SandboxError> {
            Err(SandboxError::Unsupported("restore_snapshot"))
        }

        async fn release(&self) -> Result<(), SandboxError> {
            self.released.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn silent_manager(
        tmp: &tempfile::TempDir,
        handshake: Duration,
    ) -> (SandboxManager, Arc<std::sync::atomic::AtomicUsize>) {
        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let backend = SilentBackend {
            released: released.clone(),
        };
        let timeouts = ProtocolTimeouts {
            handshake,
            ..ProtocolTimeouts::default()
        };
        (
            SandboxManager::new(Arc::new(backend), snapshots(tmp), timeouts),
            released,
        )
    }

    #[tokio::test]
    async fn provision_message_teardown() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::succeeding());
        let manager = pod_manager(&tmp, cluster.clone());

        let info = manager.provision("acme", "u1", &llm()).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Active);
        assert_eq!(info.backend, BackendKind::Kubernetes);
        assert!(manager.is_alive(&info.sandbox_id).await.unwrap());

        let events: Vec<_> = manager
            .send_message(&info.sandbox_id, "list files")
            .await
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(Ok(ProtocolEvent::PromptResponse { .. }))
        ));

        manager.teardown(&info.sandbox_id).await.unwrap();
        manager.teardown(&info.sandbox_id).await.unwrap();
        assert_eq!(
            manager.get(&info.sandbox_id).await.unwrap().status,
            SandboxStatus::Terminated
        );
        assert!(!manager.is_alive(&info.sandbox_id).await.unwrap());
        assert_eq!(cluster.calls_to("delete").len(), 1);
        assert!(matches!(
            manager.send_message(&info.sandbox_id, "again").await,
            Err(SandboxError::NotActive { status: SandboxStatus::Terminated, .. })
        ));
    }

    #[tokio::test]
    async fn second_message_while_streaming_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        let info = manager.provision("acme", "u1", &llm()).await.unwrap();

        let mut first = manager.send_message(&info.sandbox_id, "hold").await.unwrap();
        assert!(matches!(
            first.next_event().await,
            Some(Ok(ProtocolEvent::AgentMessageChunk { .. }))
        ));
        assert!(matches!(
            manager.send_message(&info.sandbox_id, "two").await,
            Err(SandboxError::Busy(_))
        ));
        assert!(matches!(
            manager.create_snapshot(&info.sandbox_id).await,
            Err(SandboxError::Busy(_))
        ));
        assert_eq!(
            manager.get(&info.sandbox_id).await.unwrap().status,
            SandboxStatus::Active
        );
        first.cancel().await;
        let events: Vec<_> = manager
            .send_message(&info.sandbox_id, "three")
            .await
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(Ok(ProtocolEvent::PromptResponse { .. }))
        ));
    }

    #[tokio::test]
    async fn malformed_frames_fail_the_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        let info = manager.provision("acme", "u1", &llm()).await.unwrap();

        let events: Vec<_> = manager
            .send_message(&info.sandbox_id, "garble")
            .await
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(Err(SandboxError::ProtocolDesync(_)))
        ));
        assert_eq!(
            manager.get(&info.sandbox_id).await.unwrap().status,
            SandboxStatus::Failed
        );
        assert!(matches!(
            manager.send_message(&info.sandbox_id, "again").await,
            Err(SandboxError::NotActive { status: SandboxStatus::Failed, .. })
        ));
        manager.teardown(&info.sandbox_id).await.unwrap();
    }

    #[tokio::test]
    async fn agent_exit_mid_prompt_fails_the_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        let info = manager.provision("acme", "u1", &llm()).await.unwrap();

        let mut stream = manager.send_message(&info.sandbox_id, "exit").await.unwrap();
        let mut last = None;
        while let Some(item) = stream.next_event().await {
            last = Some(item);
        }
        assert!(matches!(last, Some(Ok(ProtocolEvent::Error { code: None, .. }))));
        assert_eq!(
            manager.get(&info.sandbox_id).await.unwrap().status,
            SandboxStatus::Failed
        );
        assert!(matches!(
            manager.send_message(&info.sandbox_id, "again").await,
            Err(SandboxError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_timeout_fails_provision_and_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, released) = silent_manager(&tmp, Duration::from_millis(200));

        let (sandbox_id, source) = match manager.provision("acme", "u1", &llm()).await {
            Err(SandboxError::Provision { sandbox_id, source }) => (sandbox_id, source),
            other => panic!("expected provision error, got {other:?}"),
        };
        assert!(matches!(*source, SandboxError::HandshakeTimeout(_)));
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);

        let info = manager.get(&sandbox_id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Failed);
        assert!(matches!(
            manager.send_message(&sandbox_id, "hi").await,
            Err(SandboxError::NotActive { status: SandboxStatus::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_provision_releases_resources() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, released) = silent_manager(&tmp, Duration::from_secs(30));

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            manager.provision("acme", "u1", &llm()),
        )
        .await;
        assert!(outcome.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);
        let all = manager.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_identifiers_are_rejected_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        assert!(matches!(
            manager.provision("../acme", "u1", &llm()).await,
            Err(SandboxError::InvalidIdentifier { .. })
        ));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_sandbox_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        assert!(matches!(
            manager.send_message("nope", "hi").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            manager.teardown("nope").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            manager.list_files("nope", "").await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_idle_and_staleness() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = pod_manager(&tmp, Arc::new(FakeCluster::succeeding()));
        let info = manager.provision("acme", "u1", &llm()).await.unwrap();

        manager.mark_idle(&info.sandbox_id).await.unwrap();
        assert_eq!(
            manager.get(&info.sandbox_id).await.unwrap().status,
            SandboxStatus::Idle
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stale = manager.stale_sandboxes(Duration::from_millis(10)).await;
        assert_eq!(stale.len(), 1);
        assert!(manager.stale_sandboxes(Duration::from_secs(3600)).await.is_empty());

        let before = manager.get(&info.sandbox_id).await.unwrap().last_heartbeat;
        manager.heartbeat(&info.sandbox_id).await.unwrap();
        let after = manager.get(&info.sandbox_id).await.unwrap();
        assert!(after.last_heartbeat > before);
        assert_eq!(after.status, SandboxStatus::Active);
        assert!(manager.stale_sandboxes(Duration::from_secs(1)).await.is_empty());

        manager.shutdown().await;
        assert!(matches!(
            manager.heartbeat(&info.sandbox_id).await,
            Err(SandboxError::NotActive { .. })
        ));
    }
}
