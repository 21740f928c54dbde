//! Label detection client for the Google Cloud Vision `images:annotate` REST endpoint.
//!
//! Scores are returned exactly as the service reports them; this client never normalises
//! or thresholds.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::with_retry;
use crate::core::config::AppConfig;
use crate::core::models::Annotation;
use crate::errors::AnnotationError;

pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com";

/// What the annotation service should look at.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// A URL (or `gs://` URI) the service can fetch itself.
    Uri(String),
    /// Raw image bytes, sent inline.
    Inline(Vec<u8>),
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            ImageRef::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
        }
    }
}

/// Submits an image to a label/classification service.
#[async_trait]
pub trait LabelDetector: Send + Sync {
    /// Returns labels in the order the service ranked them. An empty vector is a
    /// successful call that found nothing.
    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<Annotation>, AnnotationError>;
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    label_annotations: Vec<EntityAnnotation>,
    error: Option<ServiceStatus>,
}

#[derive(Debug, Deserialize)]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    score: f32,
}

#[derive(Debug, Deserialize)]
struct ServiceStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

pub struct VisionClient {
    http: Client,
    endpoint: String,
    api_key: String,
    max_results: u32,
    retries: usize,
}

impl std::fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionClient")
            .field("endpoint", &self.endpoint)
            .field("max_results", &self.max_results)
            .finish_non_exhaustive()
    }
}

impl VisionClient {
    #[must_use]
    pub fn new(api_key: String, endpoint: Option<String>, max_results: u32) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_VISION_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            max_results,
            retries: 2,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Returns `None` when no API key is configured.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let key = config.vision_api_key.clone()?;
        info!(endpoint = %config.vision_endpoint, "Label detection enabled");
        Some(Self::new(
            key,
            Some(config.vision_endpoint.clone()),
            config.vision_max_results,
        ))
    }

    async fn annotate_once(&self, body: &Value) -> Result<Vec<Annotation>, AnnotationError> {
        let url = format!("{}/v1/images:annotate", self.endpoint);
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status, error_text));
        }

        let text = response.text().await?;
        #[cfg(feature = "debug-logs")]
        debug!("Vision response body: {}", text);

        parse_label_response(&text)
    }
}

#[async_trait]
impl LabelDetector for VisionClient {
    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<Annotation>, AnnotationError> {
        let body = build_label_request(image, self.max_results);
        debug!(image = ?image, "Requesting label detection");

        let labels = with_retry(
            self.retries,
            || async {
                self.annotate_once(&body).await.inspect_err(|e| {
                    if e.is_transient() {
                        warn!("Transient Vision failure, may retry: {}", e);
                    }
                })
            },
            AnnotationError::is_transient,
        )
        .await?;

        info!(count = labels.len(), "Label detection finished");
        Ok(labels)
    }
}

fn status_error(status: StatusCode, body: String) -> AnnotationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AnnotationError::Transport(format!("HTTP {status}: {body}"))
    } else {
        AnnotationError::Service {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Builds the `images:annotate` request body for a single image.
#[must_use]
pub fn build_label_request(image: &ImageRef, max_results: u32) -> Value {
    let image = match image {
        ImageRef::Uri(uri) => json!({ "source": { "imageUri": uri } }),
        ImageRef::Inline(bytes) => json!({ "content": STANDARD.encode(bytes) }),
    };
    json!({
        "requests": [{
            "image": image,
            "features": [{ "type": "LABEL_DETECTION", "maxResults": max_results }]
        }]
    })
}

/// Extracts labels from an `images:annotate` response body.
///
/// # Errors
///
/// Returns `AnnotationError::Service` when the per-image status carries an error and
/// `InvalidResponse` when the body is not the expected shape.
pub fn parse_label_response(body: &str) -> Result<Vec<Annotation>, AnnotationError> {
    let parsed: AnnotateResponse = serde_json::from_str(body)
        .map_err(|e| AnnotationError::InvalidResponse(e.to_string()))?;
    let first = parsed.responses.into_iter().next().ok_or_else(|| {
        AnnotationError::InvalidResponse("response contains no image results".to_string())
    })?;

    if let Some(err) = first.error.filter(|e| e.code != 0) {
        return Err(AnnotationError::Service {
            status: u16::try_from(err.code).unwrap_or(0),
            message: err.message,
        });
    }

    Ok(first
        .label_annotations
        .into_iter()
        .map(|l| Annotation {
            label: l.description,
            confidence: l.score,
        })
        .collect())
}
