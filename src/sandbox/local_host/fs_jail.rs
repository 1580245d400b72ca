use std::io::Write;
use std::path::{Path, PathBuf};

use crate::documents::sanitize_filename;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ATTACHMENTS_DIR, FilesystemEntry, numbered_name, sort_entries};
use crate::storage::layout::{normalize_relative, to_slash_path};

/// Give up on finding a free upload name after this many tries.
const MAX_UPLOAD_NAME_ATTEMPTS: u32 = 1000;

/// Path containment and listings for a local workspace.
///
/// This is NOT a chroot. Paths are validated lexically, and symlinks that
/// resolve outside the root are left out of listings.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Attach to an existing workspace directory.
    pub fn attach(root: PathBuf) -> Result<Self, SandboxError> {
        if !root.is_dir() {
            return Err(SandboxError::PathNotFound(format!(
                "workspace dir does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path to a host path inside the root.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.root.join(normalize_relative(guest_path)?))
    }

    fn contains(&self, host_path: &Path) -> bool {
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        host_path
            .canonicalize()
            .map(|p| p.starts_with(&root))
            .unwrap_or(false)
    }

    /// List one directory, directories first then case-insensitive name.
    pub fn list_dir(&self, guest_path: &str) -> Result<Vec<FilesystemEntry>, SandboxError> {
        let relative = normalize_relative(guest_path)?;
        let dir = self.root.join(&relative);
        if !dir.exists() || !self.contains(&dir) {
            return Err(SandboxError::PathNotFound(guest_path.to_string()));
        }
        if !dir.is_dir() {
            return Err(SandboxError::InvalidPath(format!("not a directory: {guest_path}")));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let host_path = entry.path();
            if entry.file_type()?.is_symlink() && !self.contains(&host_path) {
                tracing::debug!(path = %host_path.display(), "skipping symlink outside workspace");
                continue;
            }
            // Follows in-workspace symlinks.
            let Ok(meta) = std::fs::metadata(&host_path) else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_directory = meta.is_dir();
            entries.push(FilesystemEntry {
                path: to_slash_path(&relative.join(&name)),
                size: if meta.is_file() { Some(meta.len()) } else { None },
                mime_type: if is_directory { None } else { guess_mime(&name) },
                is_directory,
                name,
            });
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(guest_path)?;
        if !path.exists() || !self.contains(&path) {
            return Err(SandboxError::PathNotFound(guest_path.to_string()));
        }
        if !path.is_file() {
            return Err(SandboxError::InvalidPath(format!("not a file: {guest_path}")));
        }
        Ok(std::fs::read(&path)?)
    }

    /// Write a new file under `attachments/`, numbering the name on collision.
    pub fn upload(&self, filename: &str, data: &[u8]) -> Result<String, SandboxError> {
        let name = sanitize_filename(filename);
        let dir = self.root.join(ATTACHMENTS_DIR);
        std::fs::create_dir_all(&dir)?;
        if !self.contains(&dir) {
            return Err(SandboxError::InvalidPath(format!(
                "{ATTACHMENTS_DIR} resolves outside the workspace"
            )));
        }

        for n in 0..MAX_UPLOAD_NAME_ATTEMPTS {
            let candidate = numbered_name(&name, n);
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o644);
            match options.open(dir.join(&candidate)) {
                Ok(mut file) => {
                    file.write_all(data)?;
                    tracing::info!(file = %candidate, bytes = data.len(), "uploaded attachment");
                    return Ok(format!("{ATTACHMENTS_DIR}/{candidate}"));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SandboxError::Backend(format!("no free upload name for {name}")))
    }

    /// Remove one file or symlink. Missing is `Ok(false)`.
    pub fn delete_file(&self, guest_path: &str) -> Result<bool, SandboxError> {
        let relative = normalize_relative(guest_path)?;
        if relative.as_os_str().is_empty() {
            return Err(SandboxError::InvalidPath(format!("not a file: {guest_path}")));
        }
        let path = self.root.join(&relative);
        let parent = path.parent().unwrap_or(self.root.as_path());
        if !parent.exists() {
            return Ok(false);
        }
        if !self.contains(parent) {
            return Err(SandboxError::InvalidPath(format!(
                "path escapes workspace: {guest_path}"
            )));
        }
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Err(SandboxError::InvalidPath(format!(
                "cannot delete directory: {guest_path}"
            )));
        }
        std::fs::remove_file(&path)?;
        tracing::info!(path = %to_slash_path(&relative), "deleted workspace file");
        Ok(true)
    }
}

/// Mime type from a file name's extension.
pub fn guess_mime(name: &str) -> Option<String> {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.essence_str().to_string())
}
