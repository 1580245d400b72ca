use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;

/// Fresh sandbox id. Ids are never reused.
pub fn new_sandbox_id() -> SandboxId {
    uuid::Uuid::new_v4().to_string()
}

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Kubernetes,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            other => Err(SandboxError::Config(format!("unknown sandbox backend: {other}"))),
        }
    }
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Active,
    Idle,
    Snapshotting,
    Terminated,
    Failed,
}

impl SandboxStatus {
    /// Statuses from which a sandbox can take a message or a snapshot.
    pub fn is_live(self) -> bool {
        matches!(self, SandboxStatus::Active | SandboxStatus::Idle)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Provisioning => "provisioning",
            SandboxStatus::Active => "active",
            SandboxStatus::Idle => "idle",
            SandboxStatus::Snapshotting => "snapshotting",
            SandboxStatus::Terminated => "terminated",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Sandbox record ──────────────────────────────────────────────────

/// Where a sandbox's live filesystem is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxLocation {
    Directory { path: PathBuf },
    Pod { namespace: String, name: String },
}

impl fmt::Display for SandboxLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxLocation::Directory { path } => write!(f, "{}", path.display()),
            SandboxLocation::Pod { namespace, name } => write!(f, "pod/{namespace}/{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub sandbox_id: SandboxId,
    pub tenant_id: String,
    pub user_id: String,
    pub backend: BackendKind,
    pub location: SandboxLocation,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

// ── LLM provider ────────────────────────────────────────────────────

/// Model selection handed to the agent at launch.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider: String,
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl LlmProviderConfig {
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            api_key: None,
            api_base: None,
        }
    }
}

impl fmt::Debug for LlmProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmProviderConfig")
            .field("provider", &self.provider)
            .field("model_name", &self.model_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

// ── File listing ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemEntry {
    pub name: String,
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Directories first, then case-insensitive name.
pub fn sort_entries(entries: &mut [FilesystemEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Workspace directory that uploads land in.
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Upload name for attempt `n`: `name` itself, then `stem_1.ext`,
/// `stem_2.ext` and so on.
pub fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}

// ── Snapshots ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotResult {
    pub storage_path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub sandbox_id: SandboxId,
    pub storage_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn from_result(sandbox_id: &str, result: SnapshotResult) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            storage_path: result.storage_path,
            size_bytes: result.size_bytes,
            created_at: Utc::now(),
        }
    }
}

// ── Backend configs ─────────────────────────────────────────────────

/// Deadlines for the agent protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// Covers `initialize` and `session/new` together.
    pub handshake: Duration,
    /// Whole prompt exchange, first frame to terminal response.
    pub end_to_end: Duration,
    /// A single read from the agent.
    pub read: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            end_to_end: Duration::from_secs(900),
            read: Duration::from_secs(10),
        }
    }
}

/// How the coding agent is launched.
#[derive(Debug, Clone)]
pub struct AgentLaunchConfig {
    /// Executable followed by its fixed arguments, e.g. `["opencode", "acp"]`.
    pub command: Vec<String>,
    /// Tools the agent must not use.
    pub disabled_tools: Vec<String>,
    /// Host variables inherited by local agent processes.
    pub env_allowlist: Vec<String>,
    /// Time between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,
}

impl Default for AgentLaunchConfig {
    fn default() -> Self {
        Self {
            command: vec!["opencode".into(), "acp".into()],
            disabled_tools: vec!["question".into()],
            env_allowlist: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "TERM".into(),
                "TMPDIR".into(),
            ],
            terminate_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
}

/// Where snapshot archives and knowledge documents are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    LocalDisk { root: PathBuf },
    S3(S3Config),
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub image: String,
    pub service_account: Option<String>,
    pub kubectl_bin: String,
    pub container_name: String,
    /// Workspace directory inside the pod.
    pub workspace_dir: String,
    pub pod_ready_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "sandboxes".into(),
            image: "sandbox-agent:latest".into(),
            service_account: None,
            kubectl_bin: "kubectl".into(),
            container_name: "sandbox".into(),
            workspace_dir: "/workspace".into(),
            pod_ready_timeout: Duration::from_secs(120),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_directory: bool) -> FilesystemEntry {
        FilesystemEntry {
            name: name.into(),
            path: name.into(),
            is_directory,
            size: None,
            mime_type: None,
        }
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("Kubernetes".parse::<BackendKind>().unwrap(), BackendKind::Kubernetes);
        assert!("docker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn entries_sort_directories_first_then_name() {
        let mut entries = vec![
            entry("b.txt", false),
            entry("Zeta", true),
            entry("A.md", false),
            entry("alpha", true),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "A.md", "b.txt"]);
    }

    #[test]
    fn upload_names_count_up_before_the_extension() {
        assert_eq!(numbered_name("doc.pdf", 0), "doc.pdf");
        assert_eq!(numbered_name("doc.pdf", 2), "doc_2.pdf");
        assert_eq!(numbered_name("data.tar.gz", 1), "data.tar_1.gz");
        assert_eq!(numbered_name("README", 1), "README_1");
        assert_eq!(numbered_name(".env", 1), ".env_1");
    }

    #[test]
    fn protocol_timeouts_default() {
        let t = ProtocolTimeouts::default();
        assert_eq!(t.handshake, Duration::from_secs(30));
        assert_eq!(t.end_to_end, Duration::from_secs(900));
        assert_eq!(t.read, Duration::from_secs(10));
    }

    #[test]
    fn agent_launch_default() {
        let a = AgentLaunchConfig::default();
        assert_eq!(a.command, vec!["opencode", "acp"]);
        assert_eq!(a.disabled_tools, vec!["question"]);
        assert!(a.env_allowlist.contains(&"PATH".to_string()));
    }

    #[test]
    fn llm_config_debug_redacts_key() {
        let mut llm = LlmProviderConfig::new("anthropic", "claude-sonnet-4-5");
        llm.api_key = Some("sk-secret".into());
        let dbg = format!("{llm:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn live_statuses() {
        assert!(SandboxStatus::Active.is_live());
        assert!(SandboxStatus::Idle.is_live());
        assert!(!SandboxStatus::Failed.is_live());
        assert!(!SandboxStatus::Snapshotting.is_live());
    }
}
