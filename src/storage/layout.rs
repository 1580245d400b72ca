//! Canonical on-disk and object-key layout for tenant data.
//!
//! ```text
//! {root}/{tenant_id}/knowledge/{user_id}/...             ingested documents
//! {root}/{tenant_id}/sandboxes/{sandbox_id}/workspace/   live agent workspace
//! {root}/{tenant_id}/sandboxes/{sandbox_id}/snapshots/   snapshot archives
//! ```
//!
//! Object storage uses the same layout relative to the bucket prefix.

use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;

const KNOWLEDGE_DIR: &str = "knowledge";
const SANDBOXES_DIR: &str = "sandboxes";
const WORKSPACE_DIR: &str = "workspace";
const SNAPSHOTS_DIR: &str = "snapshots";
pub const SNAPSHOT_EXTENSION: &str = "tar.gz";

/// Check that an identifier is safe to use as a single path segment.
pub fn validate_identifier(value: &str) -> Result<(), SandboxError> {
    if value.is_empty() {
        return Err(SandboxError::invalid_identifier(value, "empty"));
    }
    if value.contains('\0') {
        return Err(SandboxError::invalid_identifier(value, "contains NUL"));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(SandboxError::invalid_identifier(value, "contains a path separator"));
    }
    if value == "." || value.contains("..") {
        return Err(SandboxError::invalid_identifier(value, "contains a traversal sequence"));
    }
    if Path::new(value).is_absolute() || value.starts_with('~') {
        return Err(SandboxError::invalid_identifier(value, "absolute path"));
    }
    Ok(())
}

/// Normalize a path relative to a workspace root.
///
/// Leading `/` is stripped, `.` segments dropped and `..` segments applied.
/// Popping past the root is an `InvalidPath` error. The empty result is the
/// root itself.
pub fn normalize_relative(path: &str) -> Result<PathBuf, SandboxError> {
    if path.contains('\0') {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(seg) => normalized.push(seg),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SandboxError::InvalidPath(format!(
                        "path escapes workspace: {path}"
                    )));
                }
            }
            Component::Prefix(_) => return Err(SandboxError::InvalidPath(path.to_string())),
        }
    }
    Ok(normalized)
}

/// Render a relative path with `/` separators.
pub fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(seg) => Some(seg.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// New snapshot id: timestamp plus a random suffix so rapid snapshots
/// never collide.
pub fn generate_snapshot_id() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("snap-{ts}-{}", &suffix[..8])
}

/// Object key of a snapshot archive.
pub fn snapshot_key(
    tenant_id: &str,
    sandbox_id: &str,
    snapshot_id: &str,
) -> Result<String, SandboxError> {
    validate_identifier(tenant_id)?;
    validate_identifier(sandbox_id)?;
    validate_identifier(snapshot_id)?;
    Ok(format!(
        "{tenant_id}/{SANDBOXES_DIR}/{sandbox_id}/{SNAPSHOTS_DIR}/{snapshot_id}.{SNAPSHOT_EXTENSION}"
    ))
}

/// Key prefix under which all of a tenant's snapshots live.
pub fn tenant_snapshot_prefix(tenant_id: &str) -> Result<String, SandboxError> {
    validate_identifier(tenant_id)?;
    Ok(format!("{tenant_id}/{SANDBOXES_DIR}/"))
}

/// Key prefix of a user's knowledge documents.
pub fn knowledge_prefix(tenant_id: &str, user_id: &str) -> Result<String, SandboxError> {
    validate_identifier(tenant_id)?;
    validate_identifier(user_id)?;
    Ok(format!("{tenant_id}/{KNOWLEDGE_DIR}/{user_id}"))
}

/// Computes and materializes tenant/user scoped directories.
#[derive(Debug, Clone)]
pub struct DirectoryManager {
    root: PathBuf,
}

impl DirectoryManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn knowledge_path(&self, tenant_id: &str, user_id: &str) -> Result<PathBuf, SandboxError> {
        validate_identifier(tenant_id)?;
        validate_identifier(user_id)?;
        Ok(self.root.join(tenant_id).join(KNOWLEDGE_DIR).join(user_id))
    }

    pub fn sandbox_path(&self, tenant_id: &str, sandbox_id: &str) -> Result<PathBuf, SandboxError> {
        validate_identifier(tenant_id)?;
        validate_identifier(sandbox_id)?;
        Ok(self.root.join(tenant_id).join(SANDBOXES_DIR).join(sandbox_id))
    }

    pub fn workspace_path(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<PathBuf, SandboxError> {
        Ok(self.sandbox_path(tenant_id, sandbox_id)?.join(WORKSPACE_DIR))
    }

    pub fn snapshots_path(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<PathBuf, SandboxError> {
        Ok(self.sandbox_path(tenant_id, sandbox_id)?.join(SNAPSHOTS_DIR))
    }

    /// Create the sandbox's workspace directory. Idempotent.
    pub fn ensure_workspace(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<PathBuf, SandboxError> {
        let workspace = self.workspace_path(tenant_id, sandbox_id)?;
        std::fs::create_dir_all(&workspace).map_err(|e| {
            SandboxError::Launch {
                executable: "workspace".into(),
                reason: format!("failed to create {}: {e}", workspace.display()),
            }
        })?;
        Ok(workspace)
    }

    /// Create the user's knowledge directory. Idempotent.
    pub fn ensure_knowledge(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<PathBuf, SandboxError> {
        let path = self.knowledge_path(tenant_id, user_id)?;
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove the live workspace, keeping local snapshots. Missing is fine.
    /// The sandbox directory goes too once nothing else is left in it.
    pub fn remove_workspace(&self, tenant_id: &str, sandbox_id: &str) -> Result<(), SandboxError> {
        let workspace = self.workspace_path(tenant_id, sandbox_id)?;
        match std::fs::remove_dir_all(&workspace) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let sandbox = self.sandbox_path(tenant_id, sandbox_id)?;
        match std::fs::remove_dir(&sandbox) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
