use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{
    AgentLaunchConfig, BackendKind, KubernetesConfig, ProtocolTimeouts, S3Config, StorageConfig,
};

const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    /// Root of tenant directories for the local backend, and of the local
    /// object store.
    pub base_path: PathBuf,
    pub storage: StorageConfig,
    pub timeouts: ProtocolTimeouts,
    pub agent: AgentLaunchConfig,
    pub kubernetes: KubernetesConfig,
    /// Heartbeat age after which a sandbox is a reclamation candidate.
    pub idle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from any key lookup (as env vars would provide).
    /// Used directly in tests to avoid mutating process-global environment.
    ///
    /// Malformed numbers fall back to their defaults; an unknown backend
    /// name is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SandboxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: u64| -> Duration {
            let secs = match get(key) {
                None => default,
                Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, default, "invalid number, using default");
                    default
                }),
            };
            Duration::from_secs(secs)
        };

        let backend = match get("SANDBOX_BACKEND") {
            Some(raw) => raw.parse::<BackendKind>()?,
            None => BackendKind::Local,
        };

        let base_path = get("SANDBOX_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_base_path);

        let default_storage = match backend {
            BackendKind::Local => "local",
            BackendKind::Kubernetes => "s3",
        };
        let storage = match get("SANDBOX_STORAGE_BACKEND")
            .unwrap_or_else(|| default_storage.to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "local" => StorageConfig::LocalDisk {
                root: base_path.clone(),
            },
            "s3" => StorageConfig::S3(S3Config {
                bucket: get("SANDBOX_S3_BUCKET").unwrap_or_default(),
                prefix: get("SANDBOX_S3_PREFIX"),
                region: get("SANDBOX_S3_REGION")
                    .or_else(|| get("AWS_REGION"))
                    .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                endpoint: get("SANDBOX_S3_ENDPOINT"),
            }),
            other => {
                return Err(SandboxError::Config(format!(
                    "unknown storage backend: {other}"
                )));
            }
        };

        let protocol_defaults = ProtocolTimeouts::default();
        let timeouts = ProtocolTimeouts {
            handshake: secs(
                "SANDBOX_HANDSHAKE_TIMEOUT_SECS",
                protocol_defaults.handshake.as_secs(),
            ),
            end_to_end: secs(
                "SANDBOX_MESSAGE_TIMEOUT_SECS",
                protocol_defaults.end_to_end.as_secs(),
            ),
            read: secs("SANDBOX_READ_TIMEOUT_SECS", protocol_defaults.read.as_secs()),
        };

        let agent_defaults = AgentLaunchConfig::default();
        let agent = AgentLaunchConfig {
            command: get("SANDBOX_AGENT_COMMAND")
                .map(|c| c.split_whitespace().map(String::from).collect())
                .unwrap_or(agent_defaults.command),
            disabled_tools: get("OPENCODE_DISABLED_TOOLS")
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(agent_defaults.disabled_tools),
            env_allowlist: agent_defaults.env_allowlist,
            terminate_grace: secs(
                "SANDBOX_TERMINATE_GRACE_SECS",
                agent_defaults.terminate_grace.as_secs(),
            ),
        };

        let k8s_defaults = KubernetesConfig::default();
        let kubernetes = KubernetesConfig {
            namespace: get("SANDBOX_NAMESPACE").unwrap_or(k8s_defaults.namespace),
            image: get("SANDBOX_CONTAINER_IMAGE").unwrap_or(k8s_defaults.image),
            service_account: get("SANDBOX_SERVICE_ACCOUNT_NAME"),
            kubectl_bin: get("KUBECTL_BIN").unwrap_or(k8s_defaults.kubectl_bin),
            pod_ready_timeout: secs(
                "SANDBOX_POD_READY_TIMEOUT_SECS",
                k8s_defaults.pod_ready_timeout.as_secs(),
            ),
            ..k8s_defaults
        };

        Ok(Config {
            backend,
            base_path,
            storage,
            timeouts,
            agent,
            kubernetes,
            idle_timeout: secs("SANDBOX_IDLE_TIMEOUT_SECONDS", DEFAULT_IDLE_TIMEOUT_SECS),
        })
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.agent.command.is_empty() {
            return Err(SandboxError::Config("agent command is empty".into()));
        }
        match (&self.backend, &self.storage) {
            (BackendKind::Kubernetes, StorageConfig::LocalDisk { .. }) => Err(SandboxError::Config(
                "kubernetes sandboxes require object storage (SANDBOX_STORAGE_BACKEND=s3)".into(),
            )),
            (_, StorageConfig::S3(s3)) if s3.bucket.is_empty() => Err(SandboxError::Config(
                "SANDBOX_S3_BUCKET is required for s3 storage".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn default_base_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(env!("CARGO_PKG_NAME"))
}
