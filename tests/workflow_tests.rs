use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bookshelf::adapters::persistence::{
    BackendKind, BookStore, CursorCodec, MemoryBookStore,
};
use bookshelf::adapters::persistence::DEFAULT_PAGE_SIZE;
use bookshelf::clients::{
    BlobMetadata, BlobUploader, ImageRef, LabelDetector, MemoryBlobStore, ObjectNaming,
};
use bookshelf::core::config::AppConfig;
use bookshelf::core::models::{
    ANONYMOUS_DISPLAY_NAME, ANONYMOUS_ID, Annotation, Attachment, Book, BookForm, BookPatch,
    CallerIdentity, NewBook, Page,
};
use bookshelf::errors::{AnnotationError, BookshelfError, StoreError, UploadError};
use bookshelf::features::books::{
    AnnotationMode, BlobReleasePolicy, BookRequest, Bookshelf, WorkflowSettings, WorkflowStep,
};

/// Memory store that counts writes and can be told to fail them.
struct CountingStore {
    inner: MemoryBookStore,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl CountingStore {
    fn new(fail_writes: bool) -> Self {
        Self {
            inner: MemoryBookStore::new(CursorCodec::new(BackendKind::Memory, None)),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(fail_writes),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("database is locked".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BookStore for CountingStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn create(&self, book: NewBook) -> Result<Book, StoreError> {
        self.check_write()?;
        self.inner.create(book).await
    }

    async fn read(&self, id: &str) -> Result<Book, StoreError> {
        self.inner.read(id).await
    }

    async fn update(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        self.check_write()?;
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.delete(id).await
    }

    async fn list_by(
        &self,
        owner_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.inner.list_by(owner_id, limit, cursor).await
    }

    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<Page, StoreError> {
        self.inner.list(limit, cursor).await
    }
}

struct FailingUploader {
    calls: AtomicUsize,
}

#[async_trait]
impl BlobUploader for FailingUploader {
    async fn upload(
        &self,
        _bytes: &[u8],
        _suggested_name: &str,
        _metadata: &BlobMetadata,
    ) -> Result<String, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(UploadError::Transport("connection reset".to_string()))
    }

    async fn delete(&self, _url: &str) -> Result<(), UploadError> {
        Ok(())
    }
}

enum Behaviour {
    Labels(Vec<Annotation>),
    Fail,
    Hang,
}

struct FakeDetector {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl FakeDetector {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LabelDetector for FakeDetector {
    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<Annotation>, AnnotationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(matches!(image, ImageRef::Uri(uri) if uri.starts_with("memory://")));
        match &self.behaviour {
            Behaviour::Labels(labels) => Ok(labels.clone()),
            Behaviour::Fail => Err(AnnotationError::Service {
                status: 403,
                message: "API key not valid".to_string(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![])
            }
        }
    }
}

fn labels() -> Vec<Annotation> {
    vec![
        Annotation {
            label: "Book".to_string(),
            confidence: 0.97,
        },
        Annotation {
            label: "Publication".to_string(),
            confidence: 0.61,
        },
    ]
}

fn settings() -> WorkflowSettings {
    WorkflowSettings {
        annotation_timeout: Duration::from_millis(50),
        ..WorkflowSettings::default()
    }
}

fn jpeg(name: &str) -> Attachment {
    Attachment {
        bytes: b"\xff\xd8\xff\xe0 not really a jpeg".to_vec(),
        file_name: name.to_string(),
        content_type: Some("image/jpeg".to_string()),
    }
}

struct Fixture {
    shelf: Bookshelf,
    store: Arc<CountingStore>,
    blobs: Arc<MemoryBlobStore>,
    detector: Arc<FakeDetector>,
}

fn fixture_with(behaviour: Behaviour, settings: WorkflowSettings) -> Fixture {
    let store = Arc::new(CountingStore::new(false));
    let blobs = Arc::new(MemoryBlobStore::new(
        "covers",
        ObjectNaming::Timestamped,
        settings.max_upload_bytes,
    ));
    let detector = FakeDetector::new(behaviour);
    let shelf = Bookshelf::new(
        store.clone(),
        blobs.clone(),
        Some(detector.clone() as Arc<dyn LabelDetector>),
        settings,
    );
    Fixture {
        shelf,
        store,
        blobs,
        detector,
    }
}

fn fixture(behaviour: Behaviour) -> Fixture {
    fixture_with(behaviour, settings())
}

fn ada() -> CallerIdentity {
    CallerIdentity::new("u1", "Ada")
}

#[tokio::test]
async fn test_create_with_cover_uploads_annotates_and_persists() {
    let fx = fixture(Behaviour::Labels(labels()));
    let caller = ada();

    let outcome = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&caller),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.steps,
        vec![
            WorkflowStep::Received,
            WorkflowStep::AttachmentPending,
            WorkflowStep::Uploaded,
            WorkflowStep::AnnotationPending,
            WorkflowStep::Annotated,
            WorkflowStep::Persisting,
            WorkflowStep::Done,
        ]
    );
    assert!(outcome.warnings.is_empty());

    let book = &outcome.book;
    assert_eq!(book.title, "Dune");
    assert_eq!(book.created_by, "Ada");
    assert_eq!(book.created_by_id, "u1");
    assert_eq!(book.annotations, Some(labels()));

    let url = book.image_url.as_deref().unwrap();
    let blob = fx.blobs.get(url).await.unwrap();
    assert_eq!(blob.content_type, "image/jpeg");
    assert_eq!(blob.owner_id.as_deref(), Some("u1"));

    assert_eq!(&fx.shelf.read(&book.id).await.unwrap(), book);
    assert_eq!(fx.detector.calls(), 1);
}

#[tokio::test]
async fn test_create_without_attachment_or_caller() {
    let fx = fixture(Behaviour::Labels(labels()));

    let outcome = fx
        .shelf
        .create(BookRequest::new(BookForm::titled("  Emma  ")), None)
        .await
        .unwrap();

    assert_eq!(
        outcome.steps,
        vec![
            WorkflowStep::Received,
            WorkflowStep::Persisting,
            WorkflowStep::Done
        ]
    );
    assert_eq!(outcome.book.title, "Emma");
    assert_eq!(outcome.book.created_by, ANONYMOUS_DISPLAY_NAME);
    assert_eq!(outcome.book.created_by_id, ANONYMOUS_ID);
    assert_eq!(outcome.book.image_url, None);
    assert_eq!(outcome.book.annotations, None);
    assert_eq!(fx.detector.calls(), 0);
    assert!(fx.blobs.is_empty().await);
}

#[tokio::test]
async fn test_lenient_annotation_timeout_saves_without_labels() {
    let fx = fixture(Behaviour::Hang);

    let outcome = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap();

    assert!(outcome.book.image_url.is_some());
    assert_eq!(outcome.book.annotations, None);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].step, WorkflowStep::AnnotationPending);
    assert!(outcome.warnings[0].message.contains("timed out"));
    assert!(outcome.steps.contains(&WorkflowStep::AnnotationSkipped));
    assert!(!outcome.steps.contains(&WorkflowStep::Annotated));
    assert_eq!(outcome.steps.last(), Some(&WorkflowStep::Done));
}

#[tokio::test]
async fn test_strict_annotation_failure_fails_without_record() {
    let fx = fixture(Behaviour::Fail);

    let err = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune"))
                .with_attachment(jpeg("dune.jpg"))
                .with_annotation_mode(AnnotationMode::Strict),
            Some(&ada()),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BookshelfError::Permanent {
            step: WorkflowStep::AnnotationPending,
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(fx.store.writes(), 0);
    // the uploaded cover is left behind
    assert_eq!(fx.blobs.len().await, 1);
}

#[tokio::test]
async fn test_upload_failure_never_reaches_store_or_annotation() {
    let store = Arc::new(CountingStore::new(false));
    let uploader = Arc::new(FailingUploader {
        calls: AtomicUsize::new(0),
    });
    let detector = FakeDetector::new(Behaviour::Labels(labels()));
    let shelf = Bookshelf::new(
        store.clone(),
        uploader.clone(),
        Some(detector.clone() as Arc<dyn LabelDetector>),
        settings(),
    );

    let err = shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.step(), Some(WorkflowStep::AttachmentPending));
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(detector.calls(), 0);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn test_persist_failure_after_upload_is_retryable() {
    let store = Arc::new(CountingStore::new(true));
    let blobs = Arc::new(MemoryBlobStore::new("covers", ObjectNaming::Timestamped, 1024));
    let shelf = Bookshelf::new(store, blobs.clone(), None, settings());

    let err = shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.step(), Some(WorkflowStep::Persisting));
    assert_eq!(blobs.len().await, 1);
}

#[tokio::test]
async fn test_validation_happens_before_side_effects() {
    let fx = fixture(Behaviour::Labels(labels()));

    let err = fx
        .shelf
        .create(BookRequest::new(BookForm::default()), Some(&ada()))
        .await
        .unwrap_err();
    assert!(matches!(err, BookshelfError::Validation(_)));

    let empty = Attachment {
        bytes: Vec::new(),
        ..jpeg("dune.jpg")
    };
    let err = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(empty),
            Some(&ada()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BookshelfError::Validation(_)));

    let pdf = Attachment {
        bytes: b"%PDF-1.4".to_vec(),
        file_name: "dune.pdf".to_string(),
        content_type: Some("application/pdf".to_string()),
    };
    let err = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(pdf),
            Some(&ada()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BookshelfError::Validation(_)));

    let mut form = BookForm::titled("Dune");
    form.extra
        .insert("createdById".to_string(), serde_json::json!("u2"));
    let err = fx
        .shelf
        .create(BookRequest::new(form), Some(&ada()))
        .await
        .unwrap_err();
    assert!(matches!(err, BookshelfError::Validation(_)));

    assert!(fx.blobs.is_empty().await);
    assert_eq!(fx.store.writes(), 0);
}

#[tokio::test]
async fn test_update_merges_fields() {
    let fx = fixture(Behaviour::Labels(labels()));
    let mut form = BookForm::titled("Dune");
    form.author = Some("Frank Herbert".to_string());
    let created = fx
        .shelf
        .create(BookRequest::new(form), Some(&ada()))
        .await
        .unwrap()
        .book;

    let patch = BookForm {
        description: Some("Spice.".to_string()),
        ..BookForm::default()
    };
    let outcome = fx
        .shelf
        .update(&created.id, BookRequest::new(patch))
        .await
        .unwrap();

    assert_eq!(
        outcome.steps,
        vec![
            WorkflowStep::Received,
            WorkflowStep::Persisting,
            WorkflowStep::Done
        ]
    );
    assert_eq!(outcome.book.title, "Dune");
    assert_eq!(outcome.book.author.as_deref(), Some("Frank Herbert"));
    assert_eq!(outcome.book.description.as_deref(), Some("Spice."));
    assert_eq!(outcome.book.created_by_id, "u1");
}

#[tokio::test]
async fn test_update_with_new_cover_replaces_labels_and_releases_old_blob() {
    let fx = fixture(Behaviour::Labels(labels()));
    let created = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    let old_url = created.image_url.clone().unwrap();

    let outcome = fx
        .shelf
        .update(
            &created.id,
            BookRequest::new(BookForm::default()).with_attachment(jpeg("dune-second-edition.jpg")),
        )
        .await
        .unwrap();

    let new_url = outcome.book.image_url.clone().unwrap();
    assert_ne!(new_url, old_url);
    assert_eq!(outcome.book.annotations, Some(labels()));
    assert!(fx.blobs.get(&old_url).await.is_none());
    assert!(fx.blobs.get(&new_url).await.is_some());
    assert_eq!(fx.blobs.len().await, 1);
}

#[tokio::test]
async fn test_update_with_new_cover_clears_stale_labels_on_lenient_failure() {
    let fx = fixture(Behaviour::Fail);
    let created = fx
        .shelf
        .create(BookRequest::new(BookForm::titled("Dune")), Some(&ada()))
        .await
        .unwrap()
        .book;
    fx.store
        .inner
        .update(
            &created.id,
            BookPatch {
                annotations: bookshelf::core::models::AnnotationUpdate::Replace(labels()),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();

    let outcome = fx
        .shelf
        .update(
            &created.id,
            BookRequest::new(BookForm::default()).with_attachment(jpeg("new.jpg")),
        )
        .await
        .unwrap();

    assert!(outcome.book.image_url.is_some());
    assert_eq!(outcome.book.annotations, None);
    assert_eq!(outcome.warnings.len(), 1);
}

#[tokio::test]
async fn test_update_unknown_id_uploads_nothing() {
    let fx = fixture(Behaviour::Labels(labels()));

    let err = fx
        .shelf
        .update(
            "missing",
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BookshelfError::NotFound(_)));
    assert!(fx.blobs.is_empty().await);

    let err = fx
        .shelf
        .update("not valid!", BookRequest::new(BookForm::titled("Dune")))
        .await
        .unwrap_err();
    assert!(matches!(err, BookshelfError::Validation(_)));
}

#[tokio::test]
async fn test_delete_releases_blob() {
    let fx = fixture(Behaviour::Labels(labels()));
    let created = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    assert_eq!(fx.blobs.len().await, 1);

    fx.shelf.delete(&created.id).await.unwrap();

    assert!(fx.blobs.is_empty().await);
    assert!(matches!(
        fx.shelf.read(&created.id).await,
        Err(BookshelfError::NotFound(_))
    ));
    assert!(matches!(
        fx.shelf.delete(&created.id).await,
        Err(BookshelfError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_orphan_policy_keeps_blob_on_delete() {
    let fx = fixture_with(
        Behaviour::Labels(labels()),
        WorkflowSettings {
            release_policy: BlobReleasePolicy::Orphan,
            ..settings()
        },
    );
    let created = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;

    fx.shelf.delete(&created.id).await.unwrap();
    assert_eq!(fx.blobs.len().await, 1);
}

#[tokio::test]
async fn test_disabled_annotation_skips_detector() {
    let fx = fixture_with(
        Behaviour::Labels(labels()),
        WorkflowSettings {
            annotation_mode: AnnotationMode::Disabled,
            ..settings()
        },
    );

    let outcome = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.steps,
        vec![
            WorkflowStep::Received,
            WorkflowStep::AttachmentPending,
            WorkflowStep::Uploaded,
            WorkflowStep::Persisting,
            WorkflowStep::Done,
        ]
    );
    assert_eq!(outcome.book.annotations, None);
    assert!(outcome.warnings.is_empty());
    assert_eq!(fx.detector.calls(), 0);
}

#[tokio::test]
async fn test_listing_through_the_shelf() {
    let fx = fixture(Behaviour::Labels(labels()));
    for i in 0..3 {
        fx.shelf
            .create(BookRequest::new(BookForm::titled(&format!("b{i}"))), Some(&ada()))
            .await
            .unwrap();
    }
    fx.shelf
        .create(BookRequest::new(BookForm::titled("other")), None)
        .await
        .unwrap();

    let page = fx.shelf.list_by("u1", Some(2), None).await.unwrap();
    assert_eq!(page.books.len(), 2);
    let rest = fx
        .shelf
        .list_by("u1", Some(2), page.next_cursor.as_deref())
        .await
        .unwrap();
    assert_eq!(rest.books.len(), 1);
    assert!(rest.next_cursor.is_none());

    assert_eq!(fx.shelf.list(Some(10), None).await.unwrap().books.len(), 4);
    assert!(matches!(
        fx.shelf.list(Some(0), None).await,
        Err(BookshelfError::Validation(_))
    ));
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ids() {
    let fx = fixture(Behaviour::Labels(labels()));
    let shelf = Arc::new(fx.shelf);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let shelf = shelf.clone();
            tokio::spawn(async move {
                shelf
                    .create(
                        BookRequest::new(BookForm::titled(&format!("b{i}")))
                            .with_attachment(jpeg(&format!("cover-{i}.jpg"))),
                        Some(&ada()),
                    )
                    .await
                    .map(|o| o.book.id)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
    assert_eq!(fx.store.inner.len().await, 10);
    assert_eq!(fx.blobs.len().await, 10);
}

#[tokio::test]
async fn test_listing_without_limit_uses_default_page_size() {
    let fx = fixture(Behaviour::Labels(labels()));
    for i in 0..DEFAULT_PAGE_SIZE + 2 {
        fx.shelf
            .create(BookRequest::new(BookForm::titled(&format!("b{i}"))), Some(&ada()))
            .await
            .unwrap();
    }

    let page = fx.shelf.list_by("u1", None, None).await.unwrap();
    assert_eq!(page.books.len(), DEFAULT_PAGE_SIZE);
    let rest = fx
        .shelf
        .list(None, page.next_cursor.as_deref())
        .await;
    // owner-filtered cursors do not resume the unfiltered listing
    assert!(matches!(rest, Err(BookshelfError::Validation(_))));

    let rest = fx
        .shelf
        .list_by("u1", None, page.next_cursor.as_deref())
        .await
        .unwrap();
    assert_eq!(rest.books.len(), 2);
    assert!(rest.next_cursor.is_none());
}

#[tokio::test]
async fn test_same_file_name_uploads_keep_their_own_bytes() {
    let fx = fixture(Behaviour::Labels(labels()));
    let cover = |bytes: &[u8]| Attachment {
        bytes: bytes.to_vec(),
        file_name: "cover.jpg".to_string(),
        content_type: Some("image/jpeg".to_string()),
    };

    let a = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("A")).with_attachment(cover(&[255, 216, 0, 1])),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    let b = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("B")).with_attachment(cover(&[255, 216, 0, 2])),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;

    let a_url = a.image_url.unwrap();
    let b_url = b.image_url.unwrap();
    assert_ne!(a_url, b_url);
    assert_eq!(fx.blobs.get(&a_url).await.unwrap().bytes, vec![255, 216, 0, 1]);
    assert_eq!(fx.blobs.get(&b_url).await.unwrap().bytes, vec![255, 216, 0, 2]);

    fx.shelf.delete(&a.id).await.unwrap();
    assert!(fx.blobs.get(&a_url).await.is_none());
    assert!(fx.blobs.get(&b_url).await.is_some());
}

#[tokio::test]
async fn test_shared_content_addressed_cover_survives_delete() {
    let store = Arc::new(CountingStore::new(false));
    let blobs = Arc::new(MemoryBlobStore::new(
        "covers",
        ObjectNaming::ContentAddressed,
        1024,
    ));
    let shelf = Bookshelf::new(store, blobs.clone(), None, settings());

    let a = shelf
        .create(
            BookRequest::new(BookForm::titled("A")).with_attachment(jpeg("a.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    let b = shelf
        .create(
            BookRequest::new(BookForm::titled("B")).with_attachment(jpeg("b.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    let url = b.image_url.clone().unwrap();
    assert_eq!(a.image_url.as_deref(), Some(url.as_str()));

    shelf.delete(&a.id).await.unwrap();
    assert!(blobs.get(&url).await.is_some());

    // re-covering B does not drop the shared object either
    let other = Attachment {
        bytes: b"\xff\xd8\xff another cover".to_vec(),
        ..jpeg("c.jpg")
    };
    shelf
        .update(&b.id, BookRequest::new(BookForm::default()).with_attachment(other))
        .await
        .unwrap();
    assert!(blobs.get(&url).await.is_some());
}

#[tokio::test]
async fn test_update_upload_failure_leaves_record_untouched() {
    let store = Arc::new(CountingStore::new(false));
    let uploader = Arc::new(FailingUploader {
        calls: AtomicUsize::new(0),
    });
    let shelf = Bookshelf::new(store.clone(), uploader.clone(), None, settings());

    let mut seeded = NewBook {
        title: "Dune".to_string(),
        created_by: "Ada".to_string(),
        created_by_id: "u1".to_string(),
        image_url: Some("memory://covers/old.jpg".to_string()),
        ..NewBook::default()
    };
    seeded.annotations = Some(labels());
    let before = store.inner.create(seeded).await.unwrap();

    let err = shelf
        .update(
            &before.id,
            BookRequest::new(BookForm::titled("Dune Messiah")).with_attachment(jpeg("new.jpg")),
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.step(), Some(WorkflowStep::AttachmentPending));
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.writes(), 0);
    assert_eq!(shelf.read(&before.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_update_persist_failure_keeps_old_cover() {
    let fx = fixture(Behaviour::Labels(labels()));
    let before = fx
        .shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            Some(&ada()),
        )
        .await
        .unwrap()
        .book;
    let old_url = before.image_url.clone().unwrap();

    fx.store.fail_writes.store(true, Ordering::SeqCst);
    let err = fx
        .shelf
        .update(
            &before.id,
            BookRequest::new(BookForm::default()).with_attachment(jpeg("second.jpg")),
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.step(), Some(WorkflowStep::Persisting));
    let after = fx.shelf.read(&before.id).await.unwrap();
    assert_eq!(after.image_url.as_deref(), Some(old_url.as_str()));
    assert_eq!(after, before);
    // old cover still served; the new upload is orphaned
    assert!(fx.blobs.get(&old_url).await.is_some());
    assert_eq!(fx.blobs.len().await, 2);
}

#[tokio::test]
async fn test_from_config_wires_in_process_collaborators() {
    let shelf = Bookshelf::from_config(&AppConfig::default()).await.unwrap();

    let outcome = shelf
        .create(
            BookRequest::new(BookForm::titled("Dune")).with_attachment(jpeg("dune.jpg")),
            None,
        )
        .await
        .unwrap();

    // no VISION_API_KEY, so annotation is skipped
    assert!(outcome.book.image_url.unwrap().starts_with("memory://local/"));
    assert_eq!(outcome.book.annotations, None);
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn test_from_config_reports_backend_failure_with_context() {
    let config = AppConfig {
        data_backend: BackendKind::Sqlite,
        sqlite_url: "sqlite:///no/such/directory/books.db".to_string(),
        ..AppConfig::default()
    };

    let err = Bookshelf::from_config(&config).await.unwrap_err();
    match err {
        BookshelfError::Config(msg) => {
            assert!(msg.starts_with("Failed to open the sqlite metadata backend: "), "{msg}");
        }
        other => panic!("Unexpected error type: {other}"),
    }
}
