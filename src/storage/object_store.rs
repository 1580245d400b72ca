//! Durable storage for snapshot archives and knowledge documents.
//!
//! - `LocalDiskStore`: files under a root directory, written temp-then-rename
//! - `S3Store`: an S3-compatible bucket, one PUT per object

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{S3Config, StorageConfig};

/// Key/value blob storage addressed by `/`-separated relative keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human readable location, e.g. `s3://bucket/prefix`.
    fn describe(&self) -> String;

    /// Write an object. Readers never observe a partial object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), SandboxError>;

    /// Read an object. `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SandboxError>;

    /// Size of an object in bytes. `None` if it does not exist.
    async fn size(&self, key: &str) -> Result<Option<u64>, SandboxError>;

    async fn exists(&self, key: &str) -> Result<bool, SandboxError> {
        Ok(self.size(key).await?.is_some())
    }

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), SandboxError>;

    /// Keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SandboxError>;
}

/// Build the store selected by configuration.
pub async fn build_object_store(
    config: &StorageConfig,
) -> Result<std::sync::Arc<dyn ObjectStore>, SandboxError> {
    match config {
        StorageConfig::LocalDisk { root } => {
            tracing::info!(root = %root.display(), "using local disk object store");
            Ok(std::sync::Arc::new(LocalDiskStore::new(root.clone())?))
        }
        StorageConfig::S3(c) => {
            tracing::info!(bucket = %c.bucket, region = %c.region, "using S3 object store");
            Ok(std::sync::Arc::new(S3Store::new(c).await?))
        }
    }
}

/// Reject keys that could escape the store root or bucket prefix.
pub fn validate_key(key: &str) -> Result<(), SandboxError> {
    if key.trim().is_empty() {
        return Err(SandboxError::InvalidPath("storage key is empty".into()));
    }
    if key.starts_with('/') {
        return Err(SandboxError::InvalidPath(format!(
            "storage key must not start with '/': {key}"
        )));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(SandboxError::InvalidPath(format!(
            "storage key contains an invalid character: {key}"
        )));
    }
    if key.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(SandboxError::InvalidPath(format!(
            "storage key must not contain '.' or '..' segments: {key}"
        )));
    }
    Ok(())
}

// ── LocalDisk ───────────────────────────────────────────────────────

pub struct LocalDiskStore {
    root: PathBuf,
}

impl LocalDiskStore {
    pub fn new(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Storage(format!(
                "failed to create storage root {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SandboxError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SandboxError> {
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| SandboxError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SandboxError::Storage(format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), SandboxError> {
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Storage(e.to_string()))?;
        // Dot files are in-flight `write_atomic` temporaries.
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            out.push(crate::storage::layout::to_slash_path(rel));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalDiskStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), SandboxError> {
        let path = self.path_for(key)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| SandboxError::Storage(format!("write task failed: {e}")))?
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, SandboxError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, SandboxError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SandboxError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SandboxError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            // Walk the deepest directory the prefix names, then filter.
            let dir_part = match prefix.rfind('/') {
                Some(idx) => &prefix[..idx],
                None => "",
            };
            let start = root.join(dir_part);
            let mut keys = Vec::new();
            if start.is_dir() {
                collect_keys(&root, &start, &mut keys)?;
            }
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| SandboxError::Storage(format!("list task failed: {e}")))?
    }
}

// ── S3 ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    /// Credentials come from the default AWS provider chain.
    pub async fn new(cfg: &S3Config) -> Result<Self, SandboxError> {
        if cfg.bucket.trim().is_empty() {
            return Err(SandboxError::Config("S3 bucket is empty".into()));
        }
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_cfg = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(cfg.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_cfg),
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
        })
    }

    fn object_key(&self, key: &str) -> Result<String, SandboxError> {
        validate_key(key)?;
        Ok(scoped(self.prefix.as_deref(), key))
    }
}

fn scoped(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim().trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{key}"),
        None => key.to_string(),
    }
}

fn backend_err(op: &str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Storage(format!("{op}: {e}"))
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix.as_deref().unwrap_or(""))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), SandboxError> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend_err("s3 put_object", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, SandboxError> {
        let object_key = self.object_key(key)?;
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(backend_err("s3 get_object", e));
            }
        };
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| backend_err("s3 collect body", e))?
            .into_bytes();
        Ok(Some(data))
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, SandboxError> {
        let object_key = self.object_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(None)
                } else {
                    Err(backend_err("s3 head_object", e))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SandboxError> {
        let object_key = self.object_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| backend_err("s3 delete_object", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SandboxError> {
        let scoped_prefix = scoped(self.prefix.as_deref(), prefix);
        let strip = scoped_prefix.len() - prefix.len();

        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&scoped_prefix);
            if let Some(t) = token.take() {
                req = req.continuation_token(t);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| backend_err("s3 list_objects_v2", e))?;

            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k[strip..].to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(str::to_string);
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }
}
