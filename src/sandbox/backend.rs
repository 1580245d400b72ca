use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::{BackendKind, SandboxId, SandboxLocation};

/// What a backend needs to allocate one sandbox.
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub sandbox_id: SandboxId,
    pub tenant_id: String,
    pub user_id: String,
}

/// Factory for isolated sandboxes of one kind.
///
/// One backend instance lives on the `SandboxManager`. Each call to
/// `allocate()` creates a fresh workspace (directory or pod) with no agent
/// running yet; the manager launches the agent through the returned handle.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Where `allocate` will place the sandbox. Deterministic per id.
    fn location_for(&self, tenant_id: &str, sandbox_id: &str)
    -> Result<SandboxLocation, SandboxError>;

    /// Create the sandbox's workspace. On error nothing is left behind.
    async fn allocate(&self, req: &AllocateRequest) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}
