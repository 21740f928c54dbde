//! Create, update, and delete workflows for book records.
//!
//! A create or update walks a fixed sequence of steps:
//!
//! ```text
//! Received -> [AttachmentPending -> Uploaded -> [AnnotationPending -> Annotated | AnnotationSkipped]]
//!          -> Persisting -> Done
//! ```
//!
//! with `Failed` reachable from any step. Steps run strictly one after another: the upload
//! finishes before annotation starts, and annotation finishes before the metadata write.
//! No transaction spans the blob store, the annotation service, and the metadata store. A
//! metadata failure after a successful upload leaves the blob orphaned; that is logged and
//! never compensated automatically.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapters::persistence::{self, BookStoreRef, DEFAULT_PAGE_SIZE};
use crate::clients::blob::{BlobMetadata, BlobUploader, MemoryBlobStore, validate_payload};
use crate::clients::s3::S3BlobUploader;
use crate::clients::vision::{ImageRef, LabelDetector, VisionClient};
use crate::core::config::{AppConfig, BlobStoreKind, DEFAULT_MAX_UPLOAD_BYTES};
use crate::core::models::{
    Annotation, AnnotationUpdate, Attachment, Book, BookForm, CallerIdentity, Page,
};
use crate::errors::{AnnotationError, BookshelfError, StoreError, UploadError};
use crate::utils::mime::{is_supported_image_mime, resolve_content_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkflowStep {
    Received,
    AttachmentPending,
    Uploaded,
    AnnotationPending,
    Annotated,
    AnnotationSkipped,
    Persisting,
    Done,
    Failed,
    /// Reads outside the create/update sequence (lookups, listings, pre-update reads).
    Querying,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to do when the annotation service fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnnotationMode {
    /// Persist without annotations and report a `PartialFailureWarning`.
    #[default]
    Lenient,
    /// Fail the whole workflow.
    Strict,
    /// Never call the annotation service.
    Disabled,
}

impl FromStr for AnnotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(AnnotationMode::Lenient),
            "strict" => Ok(AnnotationMode::Strict),
            "disabled" | "off" | "none" => Ok(AnnotationMode::Disabled),
            other => Err(format!("unknown annotation mode {other:?}")),
        }
    }
}

/// What happens to a blob once no record points at it any more.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlobReleasePolicy {
    /// Best-effort delete; a failed delete is logged and the blob stays orphaned.
    #[default]
    Release,
    /// Leave the blob in place.
    Orphan,
}

impl FromStr for BlobReleasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "release" | "delete" => Ok(BlobReleasePolicy::Release),
            "orphan" | "keep" => Ok(BlobReleasePolicy::Orphan),
            other => Err(format!("unknown blob release policy {other:?}")),
        }
    }
}

/// A degraded but successful workflow: the record was saved without something optional.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialFailureWarning {
    pub step: WorkflowStep,
    pub message: String,
}

/// The saved record plus everything the caller may want to report about how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub book: Book,
    pub warnings: Vec<PartialFailureWarning>,
    pub steps: Vec<WorkflowStep>,
}

/// Input to `create` and `update`.
#[derive(Debug, Clone, Default)]
pub struct BookRequest {
    pub form: BookForm,
    pub attachment: Option<Attachment>,
    /// Overrides the configured annotation mode for this call.
    pub annotation_mode: Option<AnnotationMode>,
}

impl BookRequest {
    #[must_use]
    pub fn new(form: BookForm) -> Self {
        Self {
            form,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    #[must_use]
    pub fn with_annotation_mode(mut self, mode: AnnotationMode) -> Self {
        self.annotation_mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub annotation_mode: AnnotationMode,
    pub release_policy: BlobReleasePolicy,
    pub upload_timeout: Duration,
    pub annotation_timeout: Duration,
    pub store_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Send image bytes to the annotation service instead of the blob URL.
    pub inline_annotation_content: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            annotation_mode: AnnotationMode::Lenient,
            release_policy: BlobReleasePolicy::Release,
            upload_timeout: Duration::from_secs(30),
            annotation_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            inline_annotation_content: false,
        }
    }
}

impl From<&AppConfig> for WorkflowSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            annotation_mode: config.annotation_mode,
            release_policy: config.blob_release_policy,
            upload_timeout: config.upload_timeout,
            annotation_timeout: config.annotation_timeout,
            store_timeout: config.store_timeout,
            max_upload_bytes: config.max_upload_bytes,
            inline_annotation_content: config.vision_inline_content,
        }
    }
}

struct PreparedAttachment {
    bytes: Vec<u8>,
    file_name: String,
    content_type: String,
}

struct MediaResult {
    image_url: String,
    annotations: Option<Vec<Annotation>>,
}

/// Step log for one workflow run.
struct Trace {
    operation: &'static str,
    steps: Vec<WorkflowStep>,
}

impl Trace {
    fn start(operation: &'static str) -> Self {
        debug!(operation, step = %WorkflowStep::Received, "Workflow started");
        Self {
            operation,
            steps: vec![WorkflowStep::Received],
        }
    }

    fn enter(&mut self, step: WorkflowStep) {
        info!(operation = self.operation, %step, "Workflow transition");
        self.steps.push(step);
    }

    fn finish(
        mut self,
        result: Result<(Book, Vec<PartialFailureWarning>), BookshelfError>,
    ) -> Result<WorkflowOutcome, BookshelfError> {
        match result {
            Ok((book, warnings)) => {
                self.enter(WorkflowStep::Done);
                info!(
                    operation = self.operation,
                    id = %book.id,
                    has_image = book.image_url.is_some(),
                    warnings = warnings.len(),
                    "Workflow finished"
                );
                Ok(WorkflowOutcome {
                    book,
                    warnings,
                    steps: self.steps,
                })
            }
            Err(e) => {
                self.enter(WorkflowStep::Failed);
                error!(
                    operation = self.operation,
                    steps = ?self.steps,
                    retryable = e.is_retryable(),
                    "Workflow failed: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

async fn within<T, E>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
    timed_out: fn(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(limit)),
    }
}

fn report_orphan(url: &str, operation: &str, reason: &str) {
    warn!(
        url,
        operation, "Blob orphaned: uploaded but not referenced by any record ({})", reason
    );
}

/// Sequences blob upload, annotation, and metadata persistence for book records.
///
/// All collaborators are injected, and a single instance may serve any number of
/// concurrent callers.
pub struct Bookshelf {
    store: BookStoreRef,
    uploader: Arc<dyn BlobUploader>,
    detector: Option<Arc<dyn LabelDetector>>,
    settings: WorkflowSettings,
}

impl fmt::Debug for Bookshelf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bookshelf")
            .field("backend", &self.store.kind())
            .field("annotation", &self.detector.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Bookshelf {
    #[must_use]
    pub fn new(
        store: BookStoreRef,
        uploader: Arc<dyn BlobUploader>,
        detector: Option<Arc<dyn LabelDetector>>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store,
            uploader,
            detector,
            settings,
        }
    }

    /// Wires the backend, blob store, and annotation client selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns `BookshelfError::Config` if a collaborator cannot be initialised.
    pub async fn from_config(config: &AppConfig) -> Result<Self, BookshelfError> {
        let store = persistence::connect(config)
            .await
            .with_context(|| {
                format!("Failed to open the {} metadata backend", config.data_backend)
            })?;

        let uploader: Arc<dyn BlobUploader> = match config.blob_store {
            BlobStoreKind::Memory => Arc::new(MemoryBlobStore::new(
                config.cloud_bucket.as_deref().unwrap_or("local"),
                config.blob_naming,
                config.max_upload_bytes,
            )),
            BlobStoreKind::S3 => Arc::new(
                S3BlobUploader::from_config(config)
                    .await
                    .context("Failed to set up the S3 blob store")?,
            ),
        };

        let detector = VisionClient::from_config(config)
            .map(|client| Arc::new(client) as Arc<dyn LabelDetector>);
        if detector.is_none() && config.annotation_mode != AnnotationMode::Disabled {
            warn!("VISION_API_KEY is not set; uploads will not be annotated");
        }

        Ok(Self::new(store, uploader, detector, WorkflowSettings::from(config)))
    }

    /// Creates a record, uploading and annotating the attachment if there is one.
    ///
    /// # Errors
    ///
    /// `Validation` before any side effect, `Transient`/`Permanent` tagged with the failing
    /// step otherwise. No record is written when the upload fails.
    pub async fn create(
        &self,
        request: BookRequest,
        caller: Option<&CallerIdentity>,
    ) -> Result<WorkflowOutcome, BookshelfError> {
        let mut trace = Trace::start("create");
        let result = self.run_create(&mut trace, request, caller).await;
        trace.finish(result)
    }

    /// Merges the form onto an existing record. A new attachment replaces the image and its
    /// annotations; the previous blob is released per policy once the update is saved.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, otherwise as for [`Bookshelf::create`].
    pub async fn update(
        &self,
        id: &str,
        request: BookRequest,
    ) -> Result<WorkflowOutcome, BookshelfError> {
        let mut trace = Trace::start("update");
        let result = self.run_update(&mut trace, id, request).await;
        trace.finish(result)
    }

    /// Removes a record and then releases its blob per policy.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn delete(&self, id: &str) -> Result<(), BookshelfError> {
        persistence::validate_id(id)
            .map_err(|e| BookshelfError::from_store(WorkflowStep::Received, e))?;
        let existing = self.read(id).await?;

        within(
            self.settings.store_timeout,
            self.store.delete(id),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| BookshelfError::from_store(WorkflowStep::Persisting, e))?;
        info!(id, "Deleted book");

        if let Some(url) = existing.image_url.as_deref() {
            self.release_blob(url, "delete").await;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Validation` for a malformed one.
    pub async fn read(&self, id: &str) -> Result<Book, BookshelfError> {
        within(
            self.settings.store_timeout,
            self.store.read(id),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| BookshelfError::from_store(WorkflowStep::Querying, e))
    }

    /// Records created by `owner_id`, resuming after `cursor`. `None` asks for
    /// [`DEFAULT_PAGE_SIZE`] records.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad limit or cursor, `Transient`/`Permanent` for store failures.
    pub async fn list_by(
        &self,
        owner_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page, BookshelfError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        within(
            self.settings.store_timeout,
            self.store.list_by(owner_id, limit, cursor),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| BookshelfError::from_store(WorkflowStep::Querying, e))
    }

    /// All records, resuming after `cursor`.
    ///
    /// # Errors
    ///
    /// As for [`Bookshelf::list_by`].
    pub async fn list(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page, BookshelfError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        within(
            self.settings.store_timeout,
            self.store.list(limit, cursor),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| BookshelfError::from_store(WorkflowStep::Querying, e))
    }

    async fn run_create(
        &self,
        trace: &mut Trace,
        request: BookRequest,
        caller: Option<&CallerIdentity>,
    ) -> Result<(Book, Vec<PartialFailureWarning>), BookshelfError> {
        let mode = request
            .annotation_mode
            .unwrap_or(self.settings.annotation_mode);
        request.form.validate_for_create()?;
        let attachment = request
            .attachment
            .map(|a| self.prepare_attachment(a))
            .transpose()?;

        let mut new_book = request.form.into_new_book(caller);
        let mut warnings = Vec::new();
        if let Some(attachment) = attachment {
            let media = self
                .run_media(
                    trace,
                    attachment,
                    &new_book.created_by_id,
                    mode,
                    &mut warnings,
                )
                .await?;
            new_book.image_url = Some(media.image_url);
            new_book.annotations = media.annotations;
        }

        trace.enter(WorkflowStep::Persisting);
        let image_url = new_book.image_url.clone();
        let book = within(
            self.settings.store_timeout,
            self.store.create(new_book),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| {
            if let Some(url) = &image_url {
                report_orphan(url, "create", &e.to_string());
            }
            BookshelfError::from_store(WorkflowStep::Persisting, e)
        })?;

        Ok((book, warnings))
    }

    async fn run_update(
        &self,
        trace: &mut Trace,
        id: &str,
        request: BookRequest,
    ) -> Result<(Book, Vec<PartialFailureWarning>), BookshelfError> {
        let mode = request
            .annotation_mode
            .unwrap_or(self.settings.annotation_mode);
        persistence::validate_id(id)
            .map_err(|e| BookshelfError::from_store(WorkflowStep::Received, e))?;
        request.form.validate_for_update()?;
        let attachment = request
            .attachment
            .map(|a| self.prepare_attachment(a))
            .transpose()?;

        // Looked up first so an unknown id fails before anything is uploaded.
        let existing = self.read(id).await?;

        let mut patch = request.form.into_patch();
        let mut warnings = Vec::new();
        if let Some(attachment) = attachment {
            let media = self
                .run_media(
                    trace,
                    attachment,
                    &existing.created_by_id,
                    mode,
                    &mut warnings,
                )
                .await?;
            patch.image_url = Some(media.image_url);
            // Old labels describe the old image.
            patch.annotations = match media.annotations {
                Some(labels) => AnnotationUpdate::Replace(labels),
                None => AnnotationUpdate::Clear,
            };
        }

        trace.enter(WorkflowStep::Persisting);
        let new_url = patch.image_url.clone();
        let book = within(
            self.settings.store_timeout,
            self.store.update(id, patch),
            StoreError::Timeout,
        )
        .await
        .map_err(|e| {
            if let Some(url) = &new_url {
                report_orphan(url, "update", &e.to_string());
            }
            BookshelfError::from_store(WorkflowStep::Persisting, e)
        })?;

        if let (Some(old), Some(new)) = (existing.image_url.as_deref(), new_url.as_deref()) {
            if old != new {
                self.release_blob(old, "update").await;
            }
        }

        Ok((book, warnings))
    }

    fn prepare_attachment(
        &self,
        attachment: Attachment,
    ) -> Result<PreparedAttachment, BookshelfError> {
        validate_payload(&attachment.bytes, self.settings.max_upload_bytes)
            .map_err(|e| BookshelfError::from_upload(WorkflowStep::Received, e))?;

        let content_type =
            resolve_content_type(&attachment.file_name, attachment.content_type.as_deref())
                .filter(|ct| is_supported_image_mime(ct))
                .ok_or_else(|| {
                    BookshelfError::Validation(format!(
                        "{} is not a supported image (jpeg, png, gif, webp)",
                        attachment.file_name
                    ))
                })?;

        Ok(PreparedAttachment {
            bytes: attachment.bytes,
            file_name: attachment.file_name,
            content_type,
        })
    }

    async fn run_media(
        &self,
        trace: &mut Trace,
        attachment: PreparedAttachment,
        owner_id: &str,
        mode: AnnotationMode,
        warnings: &mut Vec<PartialFailureWarning>,
    ) -> Result<MediaResult, BookshelfError> {
        trace.enter(WorkflowStep::AttachmentPending);
        let metadata = BlobMetadata {
            content_type: attachment.content_type.clone(),
            owner_id: Some(owner_id.to_string()),
        };
        let image_url = within(
            self.settings.upload_timeout,
            self.uploader
                .upload(&attachment.bytes, &attachment.file_name, &metadata),
            UploadError::Timeout,
        )
        .await
        .map_err(|e| BookshelfError::from_upload(WorkflowStep::AttachmentPending, e))?;
        trace.enter(WorkflowStep::Uploaded);

        let detector = match (&self.detector, mode) {
            (Some(detector), AnnotationMode::Lenient | AnnotationMode::Strict) => detector,
            _ => {
                debug!(?mode, "Annotation not requested for this call");
                return Ok(MediaResult {
                    image_url,
                    annotations: None,
                });
            }
        };

        trace.enter(WorkflowStep::AnnotationPending);
        let image = if self.settings.inline_annotation_content {
            ImageRef::Inline(attachment.bytes)
        } else {
            ImageRef::Uri(image_url.clone())
        };
        let detected = within(
            self.settings.annotation_timeout,
            detector.detect_labels(&image),
            AnnotationError::Timeout,
        )
        .await;

        let annotations = match detected {
            Ok(labels) => {
                trace.enter(WorkflowStep::Annotated);
                Some(labels)
            }
            Err(e) if mode == AnnotationMode::Lenient => {
                warn!(url = %image_url, "Annotation failed, saving without labels: {}", e);
                trace.enter(WorkflowStep::AnnotationSkipped);
                warnings.push(PartialFailureWarning {
                    step: WorkflowStep::AnnotationPending,
                    message: e.to_string(),
                });
                None
            }
            Err(e) => {
                report_orphan(&image_url, trace.operation, &e.to_string());
                return Err(BookshelfError::from_annotation(
                    WorkflowStep::AnnotationPending,
                    e,
                ));
            }
        };

        Ok(MediaResult {
            image_url,
            annotations,
        })
    }

    async fn release_blob(&self, url: &str, operation: &str) {
        if self.uploader.shares_objects() {
            // Another record may carry the same content-addressed URL.
            info!(url, operation, "Leaving shared blob in place");
            return;
        }
        match self.settings.release_policy {
            BlobReleasePolicy::Orphan => {
                info!(url, operation, "Leaving unreferenced blob in place");
            }
            BlobReleasePolicy::Release => {
                match within(
                    self.settings.upload_timeout,
                    self.uploader.delete(url),
                    UploadError::Timeout,
                )
                .await
                {
                    Ok(()) => debug!(url, operation, "Released blob"),
                    Err(e) => report_orphan(url, operation, &format!("release failed: {e}")),
                }
            }
        }
    }
}
