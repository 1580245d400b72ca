//! Persists ingested documents into a user's knowledge directory.
//!
//! Documents land at
//! `{tenant_id}/knowledge/{user_id}/{source}/{hierarchy...}/{name}.json`
//! in the configured `ObjectStore`, which is the directory a local sandbox
//! sees as its knowledge dir.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::sandbox::error::SandboxError;
use crate::storage::layout::knowledge_prefix;
use crate::storage::object_store::ObjectStore;

const MAX_NAME_LEN: usize = 200;
const TRUNCATED_NAME_LEN: usize = 150;
const MAX_ID_SUFFIX_LEN: usize = 50;
const HASH_SUFFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSection {
    pub text: Option<String>,
    pub link: Option<String>,
}

/// An ingested document as handed over by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub semantic_identifier: String,
    pub title: Option<String>,
    /// Connector source, e.g. `google_drive`.
    pub source: String,
    pub doc_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Folder path of the document in its source system.
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub sections: Vec<DocumentSection>,
    #[serde(default)]
    pub primary_owners: Vec<Value>,
    #[serde(default)]
    pub secondary_owners: Vec<Value>,
}

impl Document {
    /// File name stem before duplicate resolution.
    fn display_name(&self) -> &str {
        [
            Some(self.semantic_identifier.as_str()),
            self.title.as_deref(),
            Some(self.id.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .unwrap_or_default()
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "semantic_identifier": self.semantic_identifier,
            "title": self.title,
            "source": self.source,
            "doc_updated_at": self.doc_updated_at.map(|t| t.to_rfc3339()),
            "metadata": self.metadata,
            "doc_metadata": { "hierarchy": { "source_path": self.hierarchy } },
            "sections": self.sections,
            "primary_owners": self.primary_owners,
            "secondary_owners": self.secondary_owners,
        })
    }
}

// ── Naming ──────────────────────────────────────────────────────────

/// Make one path segment safe for filesystems and object keys.
pub fn sanitize_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '<' | '>' | '|' | '"' | '?' | '*' => '_',
            c => c,
        })
        .filter(|c| (*c as u32) >= 32)
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

fn short_hash(value: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(value.as_bytes()));
    digest[..HASH_SUFFIX_LEN].to_string()
}

/// Sanitized file stem. Long names keep a prefix plus a hash of the original.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized = sanitize_component(name);
    if sanitized.chars().count() > MAX_NAME_LEN {
        let prefix: String = sanitized.chars().take(TRUNCATED_NAME_LEN).collect();
        return format!("{prefix}_{}", short_hash(name));
    }
    sanitized
}

fn final_filename(doc: &Document, stem: &str, has_duplicates: bool) -> String {
    if !has_duplicates {
        return format!("{stem}.json");
    }
    let mut suffix = sanitize_component(&doc.id);
    if suffix.chars().count() > MAX_ID_SUFFIX_LEN {
        suffix = short_hash(&doc.id);
    }
    format!("{stem}_{suffix}.json")
}

// ── Writer ──────────────────────────────────────────────────────────

/// Writes documents for one tenant/user pair.
pub struct PersistentDocumentWriter {
    store: Arc<dyn ObjectStore>,
    tenant_id: String,
    user_id: String,
    prefix: String,
}

impl PersistentDocumentWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Self, SandboxError> {
        let prefix = knowledge_prefix(tenant_id, user_id)?;
        Ok(Self {
            store,
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            prefix,
        })
    }

    fn directory_for(&self, doc: &Document) -> String {
        let mut parts = vec![self.prefix.clone(), sanitize_component(&doc.source)];
        parts.extend(doc.hierarchy.iter().map(|p| sanitize_component(p)));
        parts.join("/")
    }

    /// Write every document and return the keys written, grouped by target
    /// directory in first-seen order. Documents that would share a file name
    /// in the same directory all get their id appended.
    pub async fn write_documents(
        &self,
        documents: &[Document],
    ) -> Result<Vec<String>, SandboxError> {
        let mut groups: Vec<((String, String), Vec<&Document>)> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for doc in documents {
            let key = (self.directory_for(doc), sanitize_filename(doc.display_name()));
            match index.get(&key) {
                Some(&i) => groups[i].1.push(doc),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![doc]));
                }
            }
        }

        let mut written = Vec::with_capacity(documents.len());
        for ((dir, stem), docs) in groups {
            let has_duplicates = docs.len() > 1;
            for doc in docs {
                let key = format!("{dir}/{}", final_filename(doc, &stem, has_duplicates));
                let body = serde_json::to_vec_pretty(&doc.to_json())?;
                self.store.put(&key, Bytes::from(body)).await?;
                tracing::debug!(key = %key, doc_id = %doc.id, "wrote document");
                written.push(key);
            }
        }

        tracing::info!(
            tenant_id = %self.tenant_id,
            user_id = %self.user_id,
            count = written.len(),
            store = %self.store.describe(),
            "persisted knowledge documents"
        );
        Ok(written)
    }
}
