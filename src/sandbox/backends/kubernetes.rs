use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::AgentTransport;
use crate::sandbox::agent_config::{ExternalDirectories, build_agent_config};
use crate::sandbox::backend::{AllocateRequest, SandboxBackend};
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::documents::sanitize_filename;
use crate::sandbox::kubernetes::pod::{
    AGENT_CONFIG_PATH, DELETE_SCRIPT, FILE_EXISTS_EXIT, LIST_SCRIPT, PATH_NOT_FOUND_EXIT,
    READ_SCRIPT, RESTORE_CONFLICT_EXIT, RESTORE_SCRIPT, WRITE_NEW_SCRIPT, WRONG_KIND_EXIT,
    build_pod_manifest, parse_listing, pod_name, snapshot_script,
};
use crate::sandbox::kubernetes::transport::ClusterTransport;
use crate::sandbox::local_host::process_manager::ProcessHandle;
use crate::sandbox::types::*;
use crate::storage::layout::{normalize_relative, to_slash_path, validate_identifier};
use crate::storage::snapshot::{SnapshotManager, check_tenant_scope};

/// One pod per sandbox, the agent attached through `kubectl exec -i`.
///
/// The workspace is an `emptyDir` volume, so a pod's files live exactly as
/// long as the pod. Snapshots stream through kubectl into object storage.
pub struct KubernetesBackend {
    config: Arc<KubernetesConfig>,
    cluster: Arc<dyn ClusterTransport>,
    agent: AgentLaunchConfig,
}

impl KubernetesBackend {
    pub fn new(
        config: KubernetesConfig,
        agent: AgentLaunchConfig,
        cluster: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            agent,
        }
    }

    async fn delete_pod(&self, name: &str) {
        let args = delete_args(&self.config, name);
        let deleted = match self.cluster.run(&args, None).await {
            Ok(out) => out.check(),
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            tracing::warn!(pod = %name, error = %e, "pod cleanup failed");
        }
    }
}

/// Deletes a half-created pod if allocation is abandoned before the handle
/// exists, including when the allocating future is dropped mid-wait.
struct PodCleanup {
    cluster: Arc<dyn ClusterTransport>,
    pod: String,
    args: Vec<String>,
    armed: bool,
}

impl PodCleanup {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PodCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(pod = %self.pod, "no runtime to delete abandoned pod");
            return;
        };
        let cluster = self.cluster.clone();
        let pod = std::mem::take(&mut self.pod);
        let args = std::mem::take(&mut self.args);
        tracing::warn!(pod = %pod, "allocation abandoned, deleting pod");
        runtime.spawn(async move {
            let deleted = match cluster.run(&args, None).await {
                Ok(out) => out.check(),
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                tracing::warn!(pod = %pod, error = %e, "pod cleanup failed");
            }
        });
    }
}

fn delete_args(config: &KubernetesConfig, name: &str) -> Vec<String> {
    vec![
        "delete".into(),
        "pod".into(),
        name.into(),
        "-n".into(),
        config.namespace.clone(),
        "--ignore-not-found=true".into(),
        "--wait=false".into(),
    ]
}

#[async_trait]
impl SandboxBackend for KubernetesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    fn location_for(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<SandboxLocation, SandboxError> {
        validate_identifier(tenant_id)?;
        validate_identifier(sandbox_id)?;
        Ok(SandboxLocation::Pod {
            namespace: self.config.namespace.clone(),
            name: pod_name(sandbox_id),
        })
    }

    async fn allocate(
        &self,
        req: &AllocateRequest,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        validate_identifier(&req.user_id)?;
        let location = self.location_for(&req.tenant_id, &req.sandbox_id)?;
        let name = pod_name(&req.sandbox_id);
        let manifest = build_pod_manifest(
            &self.config,
            &name,
            &req.tenant_id,
            &req.user_id,
            &req.sandbox_id,
        );

        tracing::info!(
            sandbox_id = %req.sandbox_id,
            pod = %name,
            namespace = %self.config.namespace,
            "creating sandbox pod"
        );
        let apply = vec![
            "apply".to_string(),
            "-n".into(),
            self.config.namespace.clone(),
            "-f".into(),
            "-".into(),
        ];
        let manifest = serde_json::to_vec(&manifest)?;
        let cleanup = PodCleanup {
            cluster: self.cluster.clone(),
            pod: name.clone(),
            args: delete_args(&self.config, &name),
            armed: true,
        };
        self.cluster
            .run(&apply, Some(Bytes::from(manifest)))
            .await?
            .check()?;

        let wait = vec![
            "wait".to_string(),
            "-n".into(),
            self.config.namespace.clone(),
            "--for=condition=Ready".into(),
            format!("pod/{name}"),
            format!("--timeout={}s", self.config.pod_ready_timeout.as_secs()),
        ];
        let ready = match self.cluster.run(&wait, None).await {
            Ok(out) => out.check(),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            tracing::warn!(pod = %name, error = %e, "pod never became ready");
            self.delete_pod(&name).await;
            cleanup.disarm();
            return Err(e);
        }
        cleanup.disarm();
        tracing::info!(pod = %name, "sandbox pod ready");

        Ok(Box::new(PodHandle {
            sandbox_id: req.sandbox_id.clone(),
            tenant_id: req.tenant_id.clone(),
            pod: name,
            location,
            config: self.config.clone(),
            cluster: self.cluster.clone(),
            agent: self.agent.clone(),
            exec: Mutex::new(None),
            launched: false,
            released: AtomicBool::new(false),
        }))
    }
}

struct PodHandle {
    sandbox_id: SandboxId,
    tenant_id: String,
    pod: String,
    location: SandboxLocation,
    config: Arc<KubernetesConfig>,
    cluster: Arc<dyn ClusterTransport>,
    agent: AgentLaunchConfig,
    /// Local kubectl process carrying the agent's stdio.
    exec: Mutex<Option<ProcessHandle>>,
    launched: bool,
    released: AtomicBool,
}

impl PodHandle {
    fn exec_args(&self, interactive: bool, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".into());
        }
        args.extend([
            "-n".to_string(),
            self.config.namespace.clone(),
            self.pod.clone(),
            "-c".into(),
            self.config.container_name.clone(),
            "--".into(),
        ]);
        args.extend(command.iter().cloned());
        args
    }

    fn shell(script: &str, params: &[&str]) -> Vec<String> {
        let mut cmd = vec!["sh".to_string(), "-c".into(), script.to_string(), "sh".into()];
        cmd.extend(params.iter().map(|p| p.to_string()));
        cmd
    }

    /// Absolute in-pod path of a workspace-relative one, plus the
    /// normalized relative form.
    fn workspace_path(&self, path: &str) -> Result<(String, String), SandboxError> {
        let relative = to_slash_path(&normalize_relative(path)?);
        let absolute = if relative.is_empty() {
            self.config.workspace_dir.clone()
        } else {
            format!("{}/{relative}", self.config.workspace_dir.trim_end_matches('/'))
        };
        Ok((absolute, relative))
    }

    fn take_exec(&self) -> Option<ProcessHandle> {
        self.exec
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl SandboxHandle for PodHandle {
    fn location(&self) -> &SandboxLocation {
        &self.location
    }

    fn agent_cwd(&self) -> String {
        self.config.workspace_dir.clone()
    }

    async fn launch_agent(
        &mut self,
        llm: &LlmProviderConfig,
    ) -> Result<AgentTransport, SandboxError> {
        if self.launched {
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

        let config = build_agent_config(
            llm,
            &self.agent.disabled_tools,
            &ExternalDirectories::Only(Vec::new()),
        );
        let write_config = self.exec_args(
            true,
            &Self::shell(
                r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
                &[AGENT_CONFIG_PATH],
            ),
        );
        self.cluster
            .run(&write_config, Some(Bytes::from(config.to_string())))
            .await?
            .check()?;

        let mut command = vec![
            "env".to_string(),
            format!("OPENCODE_CONFIG={AGENT_CONFIG_PATH}"),
            executable.clone(),
        ];
        command.extend(fixed_args.iter().cloned());
        command.push("--cwd".into());
        command.push(self.config.workspace_dir.clone());

        tracing::info!(
            sandbox_id = %self.sandbox_id,
            pod = %self.pod,
            provider = %llm.provider,
            model = %llm.model_name,
            "launching agent in pod"
        );
        let attached = self.cluster.attach(&self.exec_args(true, &command)).await?;
        *self
            .exec
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = attached.process;
        self.launched = true;
        Ok(attached.transport)
    }

    async fn is_alive(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        let args = vec![
            "get".to_string(),
            "pod".into(),
            self.pod.clone(),
            "-n".into(),
            self.config.namespace.clone(),
            "-o".into(),
            "jsonpath={.status.phase}".into(),
        ];
        match self.cluster.run(&args, None).await {
            Ok(out) => out.success() && out.stdout_string() == "Running",
            Err(e) => {
                tracing::debug!(pod = %self.pod, error = %e, "pod status check failed");
                false
            }
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FilesystemEntry>, SandboxError> {
        let (target, relative) = self.workspace_path(path)?;
        let out = self
            .cluster
            .run(&self.exec_args(false, &Self::shell(LIST_SCRIPT, &[&target])), None)
            .await?;
        match out.exit_code {
            Some(0) => Ok(parse_listing(&String::from_utf8_lossy(&out.stdout), &relative)),
            Some(PATH_NOT_FOUND_EXIT) => Err(SandboxError::PathNotFound(path.to_string())),
            Some(WRONG_KIND_EXIT) => {
                Err(SandboxError::InvalidPath(format!("not a directory: {path}")))
            }
            _ => {
                out.check()?;
                Ok(Vec::new())
            }
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError> {
        let (target, _) = self.workspace_path(path)?;
        let out = self
            .cluster
            .run(&self.exec_args(false, &Self::shell(READ_SCRIPT, &[&target])), None)
            .await?;
        match out.exit_code {
            Some(PATH_NOT_FOUND_EXIT) => Err(SandboxError::PathNotFound(path.to_string())),
            Some(WRONG_KIND_EXIT) => Err(SandboxError::InvalidPath(format!("not a file: {path}"))),
            _ => {
                out.check()?;
                Ok(Bytes::from(out.stdout))
            }
        }
    }

    async fn upload_file(&self, filename: &str, data: Bytes) -> Result<String, SandboxError> {
        let name = sanitize_filename(filename);
        let taken: HashSet<String> = match self.list_files(ATTACHMENTS_DIR).await {
            Ok(entries) => entries.into_iter().map(|e| e.name).collect(),
            Err(SandboxError::PathNotFound(_)) => HashSet::new(),
            Err(e) => return Err(e),
        };
        let (dir, _) = self.workspace_path(ATTACHMENTS_DIR)?;

        // A few extra tries for names that appear after the listing.
        let attempts = taken.len() as u32 + 8;
        for n in 0..attempts {
            let candidate = numbered_name(&name, n);
            if taken.contains(&candidate) {
                continue;
            }
            let write = self.exec_args(true, &Self::shell(WRITE_NEW_SCRIPT, &[&dir, &candidate]));
            let out = self.cluster.run(&write, Some(data.clone())).await?;
            if out.exit_code == Some(FILE_EXISTS_EXIT) {
                continue;
            }
            out.check()?;
            tracing::info!(
                sandbox_id = %self.sandbox_id,
                file = %candidate,
                bytes = data.len(),
                "uploaded attachment to pod"
            );
            return Ok(format!("{ATTACHMENTS_DIR}/{candidate}"));
        }
        Err(SandboxError::Backend(format!("no free upload name for {name}")))
    }

    async fn delete_file(&self, path: &str) -> Result<bool, SandboxError> {
        let (target, relative) = self.workspace_path(path)?;
        if relative.is_empty() {
            return Err(SandboxError::InvalidPath(format!("not a file: {path}")));
        }
        let out = self
            .cluster
            .run(&self.exec_args(false, &Self::shell(DELETE_SCRIPT, &[&target])), None)
            .await?;
        match out.exit_code {
            Some(PATH_NOT_FOUND_EXIT) => Ok(false),
            Some(WRONG_KIND_EXIT) => Err(SandboxError::InvalidPath(format!(
                "cannot delete directory: {path}"
            ))),
            _ => {
                out.check()?;
                tracing::info!(sandbox_id = %self.sandbox_id, path = %relative, "deleted pod file");
                Ok(true)
            }
        }
    }

    async fn create_snapshot(
        &self,
        snapshots: &SnapshotManager,
    ) -> Result<SnapshotResult, SandboxError> {
        let script = snapshot_script();
        let out = self
            .cluster
            .run(
                &self.exec_args(false, &Self::shell(&script, &[&self.config.workspace_dir])),
                None,
            )
            .await?;
        out.check()?;
        if out.stdout.is_empty() {
            return Err(SandboxError::Storage("pod produced an empty archive".into()));
        }
        snapshots
            .store_archive(&self.tenant_id, &self.sandbox_id, Bytes::from(out.stdout))
            .await
    }

    async fn restore_snapshot(
        &self,
        snapshots: &SnapshotManager,
        storage_path: &str,
        overwrite: bool,
    ) -> Result<(), SandboxError> {
        check_tenant_scope(&self.tenant_id, storage_path)?;
        let data = snapshots.fetch_archive(storage_path).await?;
        let flag = if overwrite { "1" } else { "0" };
        let out = self
            .cluster
            .run(
                &self.exec_args(
                    true,
                    &Self::shell(RESTORE_SCRIPT, &[&self.config.workspace_dir, flag]),
                ),
                Some(data),
            )
            .await?;
        if out.exit_code == Some(RESTORE_CONFLICT_EXIT) {
            return Err(SandboxError::RestoreConflict(PathBuf::from(
                &self.config.workspace_dir,
            )));
        }
        out.check()?;
        tracing::info!(
            sandbox_id = %self.sandbox_id,
            storage_path = %storage_path,
            "snapshot restored into pod"
        );
        Ok(())
    }

    async fn release(&self) -> Result<(), SandboxError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox_id = %self.sandbox_id, pod = %self.pod, "deleting sandbox pod");
        drop(self.take_exec());
        self.cluster
            .run(&delete_args(&self.config, &self.pod), None)
            .await?
            .check()
    }
}
