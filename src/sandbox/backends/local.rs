use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::AgentTransport;
use crate::sandbox::agent_config::{CONFIG_CONTENT_ENV, ExternalDirectories, build_agent_config};
use crate::sandbox::backend::{AllocateRequest, SandboxBackend};
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_manager::{ProcessHandle, ProcessManager};
use crate::sandbox::types::*;
use crate::storage::layout::DirectoryManager;
use crate::storage::snapshot::{SnapshotManager, check_tenant_scope};

/// Env var pointing the agent at the user's knowledge directory.
pub const KNOWLEDGE_DIR_ENV: &str = "SANDBOX_KNOWLEDGE_DIR";

/// Sandboxes as host directories with the agent as a child process.
///
/// Each sandbox gets `{root}/{tenant}/sandboxes/{id}/workspace`. The agent
/// runs as the current user with a filtered env.
/// Not a security boundary; use for trusted workloads only.
pub struct LocalBackend {
    dirs: DirectoryManager,
    processes: Arc<ProcessManager>,
    agent: AgentLaunchConfig,
}

impl LocalBackend {
    pub fn new(root: PathBuf, agent: AgentLaunchConfig) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Config(format!(
                "failed to create sandboxes root {}: {e}",
                root.display()
            ))
        })?;
        let processes = Arc::new(ProcessManager::new(agent.env_allowlist.clone()));
        Ok(Self {
            dirs: DirectoryManager::new(root),
            processes,
            agent,
        })
    }

    pub fn directories(&self) -> &DirectoryManager {
        &self.dirs
    }

    fn discard_workspace(&self, req: &AllocateRequest) {
        if let Err(e) = self.dirs.remove_workspace(&req.tenant_id, &req.sandbox_id) {
            tracing::warn!(
                sandbox_id = %req.sandbox_id,
                error = %e,
                "failed to remove workspace of abandoned sandbox"
            );
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn location_for(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<SandboxLocation, SandboxError> {
        Ok(SandboxLocation::Directory {
            path: self.dirs.workspace_path(tenant_id, sandbox_id)?,
        })
    }

    async fn allocate(
        &self,
        req: &AllocateRequest,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let workspace = self.dirs.ensure_workspace(&req.tenant_id, &req.sandbox_id)?;
        let prepared = self
            .dirs
            .ensure_knowledge(&req.tenant_id, &req.user_id)
            .and_then(|knowledge| Ok((knowledge, FsJail::attach(workspace.clone())?)));
        let (knowledge, jail) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.discard_workspace(req);
                return Err(e);
            }
        };

        tracing::info!(
            sandbox_id = %req.sandbox_id,
            tenant_id = %req.tenant_id,
            workspace = %workspace.display(),
            "local sandbox allocated"
        );

        Ok(Box::new(LocalHandle {
            sandbox_id: req.sandbox_id.clone(),
            tenant_id: req.tenant_id.clone(),
            location: SandboxLocation::Directory { path: workspace },
            knowledge,
            jail,
            dirs: self.dirs.clone(),
            processes: self.processes.clone(),
            agent: self.agent.clone(),
            process: None,
            released: AtomicBool::new(false),
        }))
    }
}

struct LocalHandle {
    sandbox_id: SandboxId,
    tenant_id: String,
    location: SandboxLocation,
    knowledge: PathBuf,
    jail: FsJail,
    dirs: DirectoryManager,
    processes: Arc<ProcessManager>,
    agent: AgentLaunchConfig,
    process: Option<ProcessHandle>,
    released: AtomicBool,
}

#[async_trait]
impl SandboxHandle for LocalHandle {
    fn location(&self) -> &SandboxLocation {
        &self.location
    }

    fn agent_cwd(&self) -> String {
        self.jail.root().display().to_string()
    }

    async fn launch_agent(
        &mut self,
        llm: &LlmProviderConfig,
    ) -> Result<AgentTransport, SandboxError> {
        if self.process.is_some() {
            return Err(SandboxError::Launch {
                executable: self.agent.command.join(" "),
                reason: "agent already running".into(),
            });
        }
        let Some((executable, fixed_args)) = self.agent.command.split_first() else {
            return Err(SandboxError::Launch {
                executable: String::new(),
                reason: "empty agent command".into(),
            });
        };

        let mut args = fixed_args.to_vec();
        args.push("--cwd".into());
        args.push(self.agent_cwd());

        let config = build_agent_config(llm, &self.agent.disabled_tools, &ExternalDirectories::Any);
        let mut env = BTreeMap::new();
        env.insert(CONFIG_CONTENT_ENV.to_string(), config.to_string());
        env.insert(KNOWLEDGE_DIR_ENV.to_string(), self.knowledge.display().to_string());

        tracing::info!(
            sandbox_id = %self.sandbox_id,
            executable = %executable,
            provider = %llm.provider,
            model = %llm.model_name,
            "launching agent"
        );

        let process = self.processes.start(executable, &args, self.jail.root(), &env)?;
        let Some((stdin, stdout)) = process.take_stdio() else {
            return Err(SandboxError::Launch {
                executable: executable.clone(),
                reason: "agent stdio unavailable".into(),
            });
        };
        self.process = Some(process);
        Ok(AgentTransport::new(stdout, stdin))
    }

    async fn is_alive(&self) -> bool {
        match &self.process {
            Some(process) => self.processes.is_alive(process).await,
            None => false,
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FilesystemEntry>, SandboxError> {
        self.jail.list_dir(path)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError> {
        self.jail.read_file(path).map(Bytes::from)
    }

    async fn upload_file(&self, filename: &str, data: Bytes) -> Result<String, SandboxError> {
        self.jail.upload(filename, &data)
    }

    async fn delete_file(&self, path: &str) -> Result<bool, SandboxError> {
        self.jail.delete_file(path)
    }

    async fn create_snapshot(
        &self,
        snapshots: &SnapshotManager,
    ) -> Result<SnapshotResult, SandboxError> {
        snapshots
            .create_snapshot(&self.tenant_id, &self.sandbox_id, self.jail.root())
            .await
    }

    async fn restore_snapshot(
        &self,
        snapshots: &SnapshotManager,
        storage_path: &str,
        overwrite: bool,
    ) -> Result<(), SandboxError> {
        check_tenant_scope(&self.tenant_id, storage_path)?;
        snapshots
            .restore_snapshot(storage_path, self.jail.root(), overwrite)
            .await
    }

    async fn release(&self) -> Result<(), SandboxError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox_id = %self.sandbox_id, "releasing local sandbox");

        let stopped = match &self.process {
            Some(process) => {
                self.processes
                    .terminate(process, self.agent.terminate_grace)
                    .await
            }
            None => Ok(()),
        };
        let removed = self.dirs.remove_workspace(&self.tenant_id, &self.sandbox_id);
        stopped.and(removed)
    }
}
