//! Blob uploader contract, object naming, and the in-memory store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::UploadError;
use crate::utils::mime::extension_for;

/// Descriptive data stored alongside an uploaded object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMetadata {
    pub content_type: String,
    pub owner_id: Option<String>,
}

/// Writes attachment bytes to a blob store and hands back a dereferenceable URL.
///
/// Implementations must not touch the metadata store; persisting the URL is the caller's job.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// # Errors
    ///
    /// `UploadError::Validation` for an empty payload (no network call is made),
    /// `Transport`/`Timeout` for retryable failures, `Rejected` for permission or quota
    /// failures.
    async fn upload(
        &self,
        bytes: &[u8],
        suggested_name: &str,
        metadata: &BlobMetadata,
    ) -> Result<String, UploadError>;

    /// Removes the object behind a URL previously returned by `upload`. Deleting an object
    /// that is already gone succeeds.
    async fn delete(&self, url: &str) -> Result<(), UploadError>;

    /// Whether one stored object may back several uploads (identical payloads share a key).
    /// Such objects are never released on behalf of a single record.
    fn shares_objects(&self) -> bool {
        false
    }
}

/// How object keys are derived from an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObjectNaming {
    /// `<unix millis>-<random hex>-<sanitised file name>`; every upload gets its own key.
    #[default]
    Timestamped,
    /// `<sha256 hex>.<ext>`; identical payloads share one object.
    ContentAddressed,
}

impl FromStr for ObjectNaming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamped" | "name" => Ok(ObjectNaming::Timestamped),
            "content" | "content-addressed" | "sha256" => Ok(ObjectNaming::ContentAddressed),
            other => Err(format!("unknown blob naming scheme {other:?}")),
        }
    }
}

impl ObjectNaming {
    #[must_use]
    pub fn object_key(
        self,
        prefix: Option<&str>,
        suggested_name: &str,
        content_type: &str,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> String {
        let name = match self {
            ObjectNaming::Timestamped => format!(
                "{}-{}-{}",
                now.timestamp_millis(),
                Uuid::new_v4().simple(),
                sanitize_file_name(suggested_name)
            ),
            ObjectNaming::ContentAddressed => {
                let digest = hex::encode(Sha256::digest(bytes));
                let ext = extension_for(content_type)
                    .map(str::to_string)
                    .or_else(|| {
                        suggested_name
                            .rsplit_once('.')
                            .map(|(_, ext)| sanitize_file_name(ext).to_ascii_lowercase())
                    });
                match ext {
                    Some(ext) => format!("{digest}.{ext}"),
                    None => digest,
                }
            }
        };

        match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(p) => format!("{p}/{name}"),
            None => name,
        }
    }
}

/// Keeps the last path component of `name` and replaces anything outside `[A-Za-z0-9._-]`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(200).collect()
    }
}

/// Rejects payloads that must never reach the network.
///
/// # Errors
///
/// Returns `UploadError::Validation` for an empty payload or one larger than `max_bytes`.
pub fn validate_payload(bytes: &[u8], max_bytes: usize) -> Result<(), UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Validation("attachment is empty".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::Validation(format!(
            "attachment is {} bytes, limit is {max_bytes}",
            bytes.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub owner_id: Option<String>,
}

/// Process-local blob store, addressed as `memory://<bucket>/<key>`.
pub struct MemoryBlobStore {
    bucket: String,
    naming: ObjectNaming,
    max_bytes: usize,
    objects: RwLock<HashMap<String, StoredBlob>>,
}

impl fmt::Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("bucket", &self.bucket)
            .field("naming", &self.naming)
            .finish_non_exhaustive()
    }
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new(bucket: impl Into<String>, naming: ObjectNaming, max_bytes: usize) -> Self {
        Self {
            bucket: bucket.into(),
            naming,
            max_bytes,
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("memory://{}/{key}", self.bucket)
    }

    fn key_for<'a>(&self, url: &'a str) -> Result<&'a str, UploadError> {
        url.strip_prefix("memory://")
            .and_then(|rest| rest.strip_prefix(self.bucket.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| UploadError::Rejected(format!("{url} is not in this store")))
    }

    pub async fn get(&self, url: &str) -> Option<StoredBlob> {
        let key = self.key_for(url).ok()?;
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlobUploader for MemoryBlobStore {
    async fn upload(
        &self,
        bytes: &[u8],
        suggested_name: &str,
        metadata: &BlobMetadata,
    ) -> Result<String, UploadError> {
        validate_payload(bytes, self.max_bytes)?;
        let key = self.naming.object_key(
            None,
            suggested_name,
            &metadata.content_type,
            bytes,
            Utc::now(),
        );
        self.objects.write().await.insert(
            key.clone(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: metadata.content_type.clone(),
                owner_id: metadata.owner_id.clone(),
            },
        );
        debug!(key, size = bytes.len(), "Stored blob in memory");
        Ok(self.url_for(&key))
    }

    async fn delete(&self, url: &str) -> Result<(), UploadError> {
        let key = self.key_for(url)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    fn shares_objects(&self) -> bool {
        self.naming == ObjectNaming::ContentAddressed
    }
}
