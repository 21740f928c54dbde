use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::adapters::persistence::BackendKind;
use crate::clients::ObjectNaming;
use crate::clients::vision::DEFAULT_VISION_ENDPOINT;
use crate::features::books::{AnnotationMode, BlobReleasePolicy};

/// 5 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStoreKind {
    S3,
    Memory,
}

impl FromStr for BlobStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(BlobStoreKind::S3),
            "memory" => Ok(BlobStoreKind::Memory),
            other => Err(format!("unknown blob store {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_backend: BackendKind,
    pub sqlite_url: String,
    pub dynamodb_table: String,
    pub dynamodb_owner_index: String,
    pub dynamodb_endpoint_url: Option<String>,
    pub cursor_secret: Option<String>,

    pub blob_store: BlobStoreKind,
    pub cloud_bucket: Option<String>,
    pub blob_key_prefix: Option<String>,
    pub blob_naming: ObjectNaming,
    pub blob_public_base_url: Option<String>,
    pub blob_presign_ttl: Option<Duration>,
    pub s3_endpoint_url: Option<String>,
    pub max_upload_bytes: usize,

    pub vision_api_key: Option<String>,
    pub vision_endpoint: String,
    pub vision_max_results: u32,
    pub vision_inline_content: bool,

    pub annotation_mode: AnnotationMode,
    pub blob_release_policy: BlobReleasePolicy,
    pub upload_timeout: Duration,
    pub annotation_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_backend: BackendKind::Memory,
            sqlite_url: "sqlite://bookshelf.db".to_string(),
            dynamodb_table: "books".to_string(),
            dynamodb_owner_index: "createdById-createdAt-index".to_string(),
            dynamodb_endpoint_url: None,
            cursor_secret: None,
            blob_store: BlobStoreKind::Memory,
            cloud_bucket: None,
            blob_key_prefix: None,
            blob_naming: ObjectNaming::Timestamped,
            blob_public_base_url: None,
            blob_presign_ttl: None,
            s3_endpoint_url: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            vision_api_key: None,
            vision_endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            vision_max_results: 10,
            vision_inline_content: false,
            annotation_mode: AnnotationMode::Lenient,
            blob_release_policy: BlobReleasePolicy::Release,
            upload_timeout: Duration::from_secs(30),
            annotation_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    /// # Errors
    ///
    /// Returns an error naming the variable whose value could not be parsed.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset or blank keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable whose value could not be parsed, or when the S3
    /// blob store is selected without `CLOUD_BUCKET`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            data_backend: parse_or(&get, "DATA_BACKEND", defaults.data_backend)?,
            sqlite_url: get("SQLITE_URL").unwrap_or(defaults.sqlite_url),
            dynamodb_table: get("DYNAMODB_TABLE").unwrap_or(defaults.dynamodb_table),
            dynamodb_owner_index: get("DYNAMODB_OWNER_INDEX")
                .unwrap_or(defaults.dynamodb_owner_index),
            dynamodb_endpoint_url: get("DYNAMODB_ENDPOINT_URL"),
            cursor_secret: get("CURSOR_SECRET"),

            blob_store: parse_or(&get, "BLOB_STORE", defaults.blob_store)?,
            cloud_bucket: get("CLOUD_BUCKET"),
            blob_key_prefix: get("BLOB_KEY_PREFIX"),
            blob_naming: parse_or(&get, "BLOB_NAMING", defaults.blob_naming)?,
            blob_public_base_url: get("BLOB_PUBLIC_BASE_URL"),
            blob_presign_ttl: get("BLOB_PRESIGN_TTL_SECS")
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| format!("BLOB_PRESIGN_TTL_SECS: {e}"))
                })
                .transpose()?,
            s3_endpoint_url: get("S3_ENDPOINT_URL"),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,

            vision_api_key: get("VISION_API_KEY"),
            vision_endpoint: get("VISION_ENDPOINT").unwrap_or(defaults.vision_endpoint),
            vision_max_results: parse_or(&get, "VISION_MAX_RESULTS", defaults.vision_max_results)?,
            vision_inline_content: parse_bool(&get, "VISION_INLINE_CONTENT", false)?,

            annotation_mode: parse_or(&get, "ANNOTATION_MODE", defaults.annotation_mode)?,
            blob_release_policy: parse_or(
                &get,
                "BLOB_RELEASE_POLICY",
                defaults.blob_release_policy,
            )?,
            upload_timeout: parse_millis(&get, "UPLOAD_TIMEOUT_MS", defaults.upload_timeout)?,
            annotation_timeout: parse_millis(
                &get,
                "ANNOTATION_TIMEOUT_MS",
                defaults.annotation_timeout,
            )?,
            store_timeout: parse_millis(&get, "STORE_TIMEOUT_MS", defaults.store_timeout)?,
        };

        if config.blob_store == BlobStoreKind::S3 && config.cloud_bucket.is_none() {
            return Err("CLOUD_BUCKET: required when BLOB_STORE=s3".to_string());
        }
        Ok(config)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| format!("{key}: {e}")),
        None => Ok(default),
    }
}

fn parse_millis<G>(get: &G, key: &str, default: Duration) -> Result<Duration, String>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))
        .map(Duration::from_millis)
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, String>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(format!("{key}: expected a boolean, got {v:?}")),
    }
}
