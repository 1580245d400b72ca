use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::types::SandboxStatus;

/// Errors from sandbox, protocol and storage operations.
///
/// Backends map their internal failures into these variants. `kind()` gives
/// a stable code for callers that need to translate errors into responses.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("failed to launch {executable}: {reason}")]
    Launch { executable: String, reason: String },

    #[error("agent handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("agent did not finish within {0:?}")]
    ProtocolTimeout(Duration),

    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("agent session is not ready (state: {0})")]
    SessionNotReady(&'static str),

    #[error("agent error {code}: {message}")]
    Agent { code: i64, message: String },

    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("restore target is not empty: {}", .0.display())]
    RestoreConflict(PathBuf),

    #[error("provisioning sandbox {sandbox_id} failed: {source}")]
    Provision {
        sandbox_id: String,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox {id} is not active (status: {status})")]
    NotActive { id: String, status: SandboxStatus },

    #[error("sandbox {0} is already handling a message")]
    Busy(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("command failed: code={code:?}, stderr={stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Stable snake_case code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Launch { .. } => "launch_error",
            SandboxError::HandshakeTimeout(_) => "handshake_timeout",
            SandboxError::ProtocolTimeout(_) => "protocol_timeout",
            SandboxError::ProtocolDesync(_) => "protocol_desync",
            SandboxError::SessionNotReady(_) => "session_not_ready",
            SandboxError::Agent { .. } => "agent_error",
            SandboxError::InvalidIdentifier { .. } => "invalid_identifier",
            SandboxError::InvalidPath(_) => "invalid_path",
            SandboxError::SnapshotNotFound(_) => "snapshot_not_found",
            SandboxError::RestoreConflict(_) => "restore_conflict",
            SandboxError::Provision { .. } => "provision_error",
            SandboxError::NotFound(_) => "sandbox_not_found",
            SandboxError::NotActive { .. } => "sandbox_not_active",
            SandboxError::Busy(_) => "sandbox_busy",
            SandboxError::PathNotFound(_) => "path_not_found",
            SandboxError::Unsupported(_) => "unsupported",
            SandboxError::CommandFailed { .. } => "command_failed",
            SandboxError::Storage(_) => "storage_error",
            SandboxError::Config(_) => "config_error",
            SandboxError::Io(_) => "io_error",
            SandboxError::Serde(_) => "serialization_error",
            SandboxError::Backend(_) => "backend_error",
        }
    }

    /// Whether the session that produced this error can no longer be used.
    /// The owning sandbox is moved to `Failed` and never restarted silently.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            SandboxError::HandshakeTimeout(_) | SandboxError::ProtocolDesync(_)
        )
    }

    pub(crate) fn invalid_identifier(value: &str, reason: &'static str) -> Self {
        SandboxError::InvalidIdentifier {
            value: value.to_string(),
            reason,
        }
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Serde(err.to_string())
    }
}
