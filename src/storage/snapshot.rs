//! Workspace snapshots as gzip-compressed tar archives.
//!
//! Archives are reproducible: entries are walked in sorted order and every
//! header is normalized (mtime 0, uid/gid 0, mode 0644 or 0755), and the gzip
//! header carries no timestamp or file name. Two workspaces with identical
//! contents produce byte-identical archives.
//!
//! Transient paths (caches, lock files, editor swap files) and symlinks are
//! never archived. Restore extracts into a staging directory next to the
//! target and only then moves entries into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::SnapshotResult;
use crate::storage::layout::{
    generate_snapshot_id, snapshot_key, tenant_snapshot_prefix, to_slash_path,
};
use crate::storage::object_store::ObjectStore;

pub(crate) const EXCLUDED_DIRS: &[&str] = &[".cache", "__pycache__", ".next", ".pytest_cache"];
pub(crate) const EXCLUDED_SUFFIXES: &[&str] = &[".lock", ".pid", ".swp"];

fn is_excluded(name: &str, is_dir: bool) -> bool {
    if is_dir {
        EXCLUDED_DIRS.contains(&name)
    } else {
        EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s))
    }
}

fn normalized_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        return 0o755;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            return 0o755;
        }
    }
    0o644
}

fn header_for(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Build a deterministic tar.gz of `workspace`.
pub fn build_archive(workspace: &Path) -> Result<Vec<u8>, SandboxError> {
    if !workspace.is_dir() {
        return Err(SandboxError::PathNotFound(workspace.display().to_string()));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    let walker = walkdir::WalkDir::new(workspace)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !is_excluded(&name, e.file_type().is_dir())
        });

    for entry in walker {
        let entry = entry.map_err(|e| SandboxError::Storage(format!("walk workspace: {e}")))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            tracing::debug!(path = %entry.path().display(), "skipping symlink in snapshot");
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .map_err(|e| SandboxError::Storage(e.to_string()))?;
        let rel_str = to_slash_path(rel);
        let meta = entry
            .metadata()
            .map_err(|e| SandboxError::Storage(format!("stat {}: {e}", entry.path().display())))?;

        if file_type.is_dir() {
            let mut header = header_for(tar::EntryType::Directory, 0, 0o755);
            builder.append_data(&mut header, &rel_str, std::io::empty())?;
        } else if file_type.is_file() {
            let file = std::fs::File::open(entry.path())?;
            let mut header =
                header_for(tar::EntryType::Regular, meta.len(), normalized_mode(&meta));
            builder.append_data(&mut header, &rel_str, file)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn dir_is_non_empty(path: &Path) -> Result<bool, SandboxError> {
    match std::fs::read_dir(path) {
        Ok(mut it) => Ok(it.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn clear_dir(path: &Path) -> Result<(), SandboxError> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let ft = entry.file_type()?;
        if ft.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn unpack_into(data: &[u8], dest: &Path) -> Result<(), SandboxError> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(false);
    let entries = archive
        .entries()
        .map_err(|e| SandboxError::Storage(format!("corrupt snapshot: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| SandboxError::Storage(format!("corrupt snapshot: {e}")))?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            tracing::warn!(entry_type = ?kind, "skipping unsupported snapshot entry");
            continue;
        }
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| SandboxError::Storage(format!("corrupt snapshot: {e}")))?;
        if !unpacked {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            return Err(SandboxError::InvalidPath(format!(
                "snapshot entry escapes target: {path}"
            )));
        }
    }
    Ok(())
}

/// Extract a tar.gz into `target`.
///
/// A non-empty target is a `RestoreConflict` unless `overwrite` is set, in
/// which case the target ends up matching the archive exactly. The target
/// directory itself is kept so processes with it as cwd stay valid.
pub fn extract_archive(data: &[u8], target: &Path, overwrite: bool) -> Result<(), SandboxError> {
    if dir_is_non_empty(target)? && !overwrite {
        return Err(SandboxError::RestoreConflict(target.to_path_buf()));
    }
    let parent = target
        .parent()
        .ok_or_else(|| SandboxError::InvalidPath(target.display().to_string()))?;
    std::fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(parent)?;
    unpack_into(data, staging.path())?;

    std::fs::create_dir_all(target)?;
    clear_dir(target)?;
    for entry in std::fs::read_dir(staging.path())? {
        let entry = entry?;
        std::fs::rename(entry.path(), target.join(entry.file_name()))?;
    }
    Ok(())
}

/// Snapshot key must live under the tenant's sandboxes prefix.
pub fn check_tenant_scope(tenant_id: &str, storage_path: &str) -> Result<(), SandboxError> {
    let prefix = tenant_snapshot_prefix(tenant_id)?;
    if !storage_path.starts_with(&prefix) || storage_path.split('/').any(|s| s == "..") {
        return Err(SandboxError::invalid_identifier(
            storage_path,
            "snapshot belongs to another tenant",
        ));
    }
    Ok(())
}

/// Archives and restores workspaces through an injected `ObjectStore`.
#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<dyn ObjectStore>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Archive a local workspace and store it.
    pub async fn create_snapshot(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
        workspace: &Path,
    ) -> Result<SnapshotResult, SandboxError> {
        let workspace: PathBuf = workspace.to_path_buf();
        let data = tokio::task::spawn_blocking(move || build_archive(&workspace))
            .await
            .map_err(|e| SandboxError::Storage(format!("archive task failed: {e}")))??;
        self.store_archive(tenant_id, sandbox_id, Bytes::from(data)).await
    }

    /// Store an archive produced elsewhere (e.g. inside a pod).
    pub async fn store_archive(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
        data: Bytes,
    ) -> Result<SnapshotResult, SandboxError> {
        let key = snapshot_key(tenant_id, sandbox_id, &generate_snapshot_id())?;
        let size_bytes = data.len() as u64;
        self.store.put(&key, data).await?;
        tracing::info!(
            sandbox_id = %sandbox_id,
            storage_path = %key,
            size_bytes,
            "snapshot stored"
        );
        Ok(SnapshotResult {
            storage_path: key,
            size_bytes,
        })
    }

    /// Load an archive. Missing is `SnapshotNotFound`.
    pub async fn fetch_archive(&self, storage_path: &str) -> Result<Bytes, SandboxError> {
        self.store
            .get(storage_path)
            .await?
            .ok_or_else(|| SandboxError::SnapshotNotFound(storage_path.to_string()))
    }

    /// Restore an archive into a local directory.
    pub async fn restore_snapshot(
        &self,
        storage_path: &str,
        target: &Path,
        overwrite: bool,
    ) -> Result<(), SandboxError> {
        let data = self.fetch_archive(storage_path).await?;
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&data, &target, overwrite))
            .await
            .map_err(|e| SandboxError::Storage(format!("restore task failed: {e}")))??;
        tracing::info!(storage_path = %storage_path, "snapshot restored");
        Ok(())
    }

    pub async fn list_snapshots(
        &self,
        tenant_id: &str,
        sandbox_id: &str,
    ) -> Result<Vec<String>, SandboxError> {
        let key = snapshot_key(tenant_id, sandbox_id, "label")?;
        let prefix = match key.rfind('/') {
            Some(idx) => &key[..=idx],
            None => key.as_str(),
        };
        self.store.list(prefix).await
    }

    pub async fn snapshot_size(&self, storage_path: &str) -> Result<u64, SandboxError> {
        self.store
            .size(storage_path)
            .await?
            .ok_or_else(|| SandboxError::SnapshotNotFound(storage_path.to_string()))
    }

    pub async fn delete_snapshot(&self, storage_path: &str) -> Result<(), SandboxError> {
        self.store.delete(storage_path).await
    }
}

/// Read every file under `root` into a sorted (path, contents) list.
#[cfg(test)]
pub(crate) fn tree_contents(root: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let mut buf = Vec::new();
            std::fs::File::open(entry.path())
                .unwrap()
                .read_to_end(&mut buf)
                .unwrap();
            let rel = entry.path().strip_prefix(root).unwrap();
            out.push((to_slash_path(rel), buf));
        }
    }
    out
}
