pub mod agent_config;
pub mod backend;
pub mod backends;
pub mod error;
pub mod handle;
pub mod kubernetes;
pub mod local_host;
pub mod manager;
pub mod types;

use std::sync::Arc;

pub use backend::{AllocateRequest, SandboxBackend};
pub use error::SandboxError;
pub use handle::SandboxHandle;
pub use manager::{MessageStream, SandboxManager};
pub use types::*;

use crate::config::Config;
use crate::storage::object_store::build_object_store;
use crate::storage::snapshot::SnapshotManager;
use backends::kubernetes::KubernetesBackend;
use backends::local::LocalBackend;
use kubernetes::transport::KubectlTransport;

/// Build a sandbox manager from runtime config.
pub async fn build_manager(config: &Config) -> Result<SandboxManager, SandboxError> {
    config.validate()?;
    let store = build_object_store(&config.storage).await?;

    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Local => {
            tracing::info!(
                base_path = %config.base_path.display(),
                agent = ?config.agent.command,
                "initializing local sandbox backend"
            );
            Arc::new(LocalBackend::new(config.base_path.clone(), config.agent.clone())?)
        }
        BackendKind::Kubernetes => {
            tracing::info!(
                namespace = %config.kubernetes.namespace,
                image = %config.kubernetes.image,
                "initializing kubernetes sandbox backend"
            );
            let cluster = Arc::new(KubectlTransport::new(config.kubernetes.kubectl_bin.clone()));
            Arc::new(KubernetesBackend::new(
                config.kubernetes.clone(),
                config.agent.clone(),
                cluster,
            ))
        }
    };

    Ok(SandboxManager::new(
        backend,
        SnapshotManager::new(store),
        config.timeouts,
    ))
}
