//! S3 blob uploader.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tracing::{info, warn};

use super::blob::{BlobMetadata, BlobUploader, ObjectNaming, validate_payload};
use super::with_retry;
use crate::core::config::AppConfig;
use crate::errors::{UploadError, aws_error_is_transient};

/// Characters left alone when a key becomes a URL path: unreserved plus `/`.
const KEY_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// How returned URLs are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStyle {
    /// `<public base>/<key>`; the bucket or a CDN in front of it must allow public reads.
    Public,
    /// A presigned GET URL valid for the given duration.
    Presigned(Duration),
}

#[derive(Debug, Clone)]
pub struct S3BlobUploader {
    client: S3Client,
    bucket: String,
    key_prefix: Option<String>,
    naming: ObjectNaming,
    url_style: UrlStyle,
    public_base_url: String,
    max_bytes: usize,
    retries: usize,
}

impl S3BlobUploader {
    #[must_use]
    pub fn new(client: S3Client, bucket: impl Into<String>, public_base_url: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key_prefix: None,
            naming: ObjectNaming::default(),
            url_style: UrlStyle::Public,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            max_bytes: crate::core::config::DEFAULT_MAX_UPLOAD_BYTES,
            retries: 2,
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.key_prefix = prefix;
        self
    }

    #[must_use]
    pub fn with_naming(mut self, naming: ObjectNaming) -> Self {
        self.naming = naming;
        self
    }

    #[must_use]
    pub fn with_url_style(mut self, style: UrlStyle) -> Self {
        self.url_style = style;
        self
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Builds an uploader from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `CLOUD_BUCKET` is unset.
    pub async fn from_config(config: &AppConfig) -> Result<Self, UploadError> {
        let bucket = config
            .cloud_bucket
            .clone()
            .ok_or_else(|| UploadError::Rejected("CLOUD_BUCKET is not configured".to_string()))?;

        let shared = aws_config::from_env().load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.s3_endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        let public_base_url = match (&config.blob_public_base_url, &config.s3_endpoint_url) {
            (Some(base), _) => base.clone(),
            (None, Some(endpoint)) => format!("{}/{bucket}", endpoint.trim_end_matches('/')),
            (None, None) => {
                let region = shared
                    .region()
                    .map_or_else(|| "us-east-1".to_string(), ToString::to_string);
                format!("https://{bucket}.s3.{region}.amazonaws.com")
            }
        };
        let url_style = config
            .blob_presign_ttl
            .map_or(UrlStyle::Public, UrlStyle::Presigned);

        info!(bucket = %bucket, base = %public_base_url, ?url_style, "Using S3 blob store");
        Ok(Self::new(client, bucket, public_base_url)
            .with_key_prefix(config.blob_key_prefix.clone())
            .with_naming(config.blob_naming)
            .with_url_style(url_style)
            .with_max_bytes(config.max_upload_bytes))
    }

    /// Public URL for an object key.
    #[must_use]
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.public_base_url,
            utf8_percent_encode(key, KEY_PATH)
        )
    }

    /// Recovers the object key from a URL produced by this uploader.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Rejected` if the URL does not point into this bucket.
    pub fn key_from_url(&self, url: &str) -> Result<String, UploadError> {
        let not_ours = || UploadError::Rejected(format!("{url} does not belong to bucket {}", self.bucket));

        let encoded = if let Some(rest) = url.strip_prefix(&format!("{}/", self.public_base_url)) {
            rest.split(['?', '#']).next().unwrap_or("").to_string()
        } else {
            let parsed = url::Url::parse(url).map_err(|_| not_ours())?;
            let host = parsed.host_str().unwrap_or("");
            let path = parsed.path().trim_start_matches('/');
            if host.starts_with(&format!("{}.", self.bucket)) {
                path.to_string()
            } else {
                path.strip_prefix(&format!("{}/", self.bucket))
                    .ok_or_else(not_ours)?
                    .to_string()
            }
        };
        if encoded.is_empty() {
            return Err(not_ours());
        }
        Ok(percent_decode_str(&encoded).decode_utf8_lossy().into_owned())
    }

    async fn url_for(&self, key: &str) -> Result<String, UploadError> {
        match self.url_style {
            UrlStyle::Public => Ok(self.public_url(key)),
            UrlStyle::Presigned(ttl) => {
                let presign = PresigningConfig::expires_in(ttl)
                    .map_err(|e| UploadError::Rejected(format!("presign config: {e}")))?;
                let request = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .presigned(presign)
                    .await
                    .map_err(|e| upload_failure("presign get_object", &e))?;
                Ok(request.uri().to_string())
            }
        }
    }
}

#[async_trait]
impl BlobUploader for S3BlobUploader {
    async fn upload(
        &self,
        bytes: &[u8],
        suggested_name: &str,
        metadata: &BlobMetadata,
    ) -> Result<String, UploadError> {
        validate_payload(bytes, self.max_bytes)?;
        let key = self.naming.object_key(
            self.key_prefix.as_deref(),
            suggested_name,
            &metadata.content_type,
            bytes,
            Utc::now(),
        );
        let original_name = utf8_percent_encode(suggested_name, NON_ALPHANUMERIC).to_string();

        with_retry(
            self.retries,
            || async {
                let mut request = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(bytes.to_vec()))
                    .content_type(&metadata.content_type)
                    .metadata("original-name", &original_name);
                if let Some(owner) = &metadata.owner_id {
                    request = request.metadata("owner-id", owner);
                }
                request.send().await.map_err(|e| {
                    let failure = upload_failure("put_object", &e);
                    if failure.is_transient() {
                        warn!(key = %key, "Transient S3 failure, may retry: {}", failure);
                    }
                    failure
                })
            },
            UploadError::is_transient,
        )
        .await?;

        info!(bucket = %self.bucket, key = %key, size = bytes.len(), "Uploaded blob");
        self.url_for(&key).await
    }

    async fn delete(&self, url: &str) -> Result<(), UploadError> {
        let key = self.key_from_url(url)?;
        with_retry(
            self.retries,
            || async {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| upload_failure("delete_object", &e))
            },
            UploadError::is_transient,
        )
        .await?;
        info!(bucket = %self.bucket, key = %key, "Deleted blob");
        Ok(())
    }

    fn shares_objects(&self) -> bool {
        self.naming == ObjectNaming::ContentAddressed
    }
}

fn upload_failure<E, R>(op: &str, error: &SdkError<E, R>) -> UploadError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("s3 {op}: {}", DisplayErrorContext(error));
    if aws_error_is_transient(error) {
        return UploadError::Transport(message);
    }
    match error {
        SdkError::ServiceError(_) | SdkError::ConstructionFailure(_) => {
            UploadError::Rejected(message)
        }
        _ => UploadError::Transport(message),
    }
}
