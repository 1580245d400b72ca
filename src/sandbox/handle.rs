use async_trait::async_trait;
use bytes::Bytes;

use super::error::SandboxError;
use super::types::{FilesystemEntry, LlmProviderConfig, SandboxLocation, SnapshotResult};
use crate::protocol::AgentTransport;
use crate::storage::snapshot::SnapshotManager;

/// Handle to one allocated sandbox. Everything the manager needs.
///
/// Backends implement this trait. Operations that a backend does not
/// support should return `SandboxError::Unsupported`.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn location(&self) -> &SandboxLocation;

    /// The agent's working directory as the agent sees it.
    fn agent_cwd(&self) -> String;

    // ── Agent ───────────────────────────────────────────────────

    /// Start the coding agent and hand back its stdio. Called once.
    async fn launch_agent(
        &mut self,
        llm: &LlmProviderConfig,
    ) -> Result<AgentTransport, SandboxError>;

    /// Whether the agent process (or pod) is still running.
    async fn is_alive(&self) -> bool;

    // ── Files ───────────────────────────────────────────────────

    /// One level of the workspace at `path` (relative, `""` for the root).
    async fn list_files(&self, path: &str) -> Result<Vec<FilesystemEntry>, SandboxError>;

    /// Contents of the regular file at `path`.
    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError>;

    /// Store `data` under the attachments directory without replacing an
    /// existing file. Returns the workspace-relative path it was saved to.
    async fn upload_file(&self, filename: &str, data: Bytes) -> Result<String, SandboxError>;

    /// Remove the file at `path`. `Ok(false)` if there was nothing there;
    /// directories are refused.
    async fn delete_file(&self, path: &str) -> Result<bool, SandboxError>;

    // ── Snapshots ───────────────────────────────────────────────

    async fn create_snapshot(
        &self,
        snapshots: &SnapshotManager,
    ) -> Result<SnapshotResult, SandboxError>;

    async fn restore_snapshot(
        &self,
        snapshots: &SnapshotManager,
        storage_path: &str,
        overwrite: bool,
    ) -> Result<(), SandboxError>;

    // ── Lifecycle ───────────────────────────────────────────────

    /// Stop the agent and free the workspace. Safe to call repeatedly.
    async fn release(&self) -> Result<(), SandboxError>;
}
