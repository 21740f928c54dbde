use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BookshelfError;

/// Display name recorded when a book is created without a caller identity.
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";
/// Owner id recorded when a book is created without a caller identity.
pub const ANONYMOUS_ID: &str = "anonymous";

const MAX_FIELD_CHARS: usize = 1024;
const MAX_DESCRIPTION_CHARS: usize = 8192;
const MAX_EXTRA_KEY_CHARS: usize = 64;

/// Field names owned by the record itself; `extra` may not shadow them.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "title",
    "author",
    "publishedDate",
    "description",
    "createdBy",
    "createdById",
    "imageUrl",
    "annotations",
    "createdAt",
    "updatedAt",
];

/// One label returned by the annotation service. `confidence` is passed through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub label: String,
    pub confidence: f32,
}

/// A persisted book record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub description: Option<String>,
    pub created_by: String,
    pub created_by_id: String,
    pub image_url: Option<String>,
    /// `None` means annotation was not attempted (or failed leniently);
    /// `Some(vec![])` is a successful call that found nothing.
    pub annotations: Option<Vec<Annotation>>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// Merges `patch` onto this record. Fields absent from the patch are kept.
    pub fn apply(&mut self, patch: BookPatch, now: DateTime<Utc>) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(author) = patch.author {
            self.author = Some(author);
        }
        if let Some(published_date) = patch.published_date {
            self.published_date = Some(published_date);
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(image_url) = patch.image_url {
            self.image_url = Some(image_url);
        }
        match patch.annotations {
            AnnotationUpdate::Keep => {}
            AnnotationUpdate::Clear => self.annotations = None,
            AnnotationUpdate::Replace(labels) => self.annotations = Some(labels),
        }
        self.extra.extend(patch.extra);
        self.updated_at = now;
    }
}

/// Everything needed to persist a new record. `id` is assigned by the backend when absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewBook {
    pub id: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub description: Option<String>,
    pub created_by: String,
    pub created_by_id: String,
    pub image_url: Option<String>,
    pub annotations: Option<Vec<Annotation>>,
    pub extra: BTreeMap<String, Value>,
}

impl NewBook {
    #[must_use]
    pub fn into_book(self, id: String, now: DateTime<Utc>) -> Book {
        Book {
            id,
            title: self.title,
            author: self.author,
            published_date: self.published_date,
            description: self.description,
            created_by: self.created_by,
            created_by_id: self.created_by_id,
            image_url: self.image_url,
            annotations: self.annotations,
            extra: self.extra,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How an update treats the stored annotations.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AnnotationUpdate {
    #[default]
    Keep,
    Clear,
    Replace(Vec<Annotation>),
}

/// A partial update. `None` fields and missing `extra` keys leave stored values untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub annotations: AnnotationUpdate,
    pub extra: BTreeMap<String, Value>,
}

/// Caller-editable fields, as submitted by a form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookForm {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BookForm {
    #[must_use]
    pub fn titled(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns `BookshelfError::Validation` if the title is missing or any field is malformed.
    pub fn validate_for_create(&self) -> Result<(), BookshelfError> {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => {}
            _ => return Err(BookshelfError::Validation("title is required".to_string())),
        }
        self.validate_fields()
    }

    /// # Errors
    ///
    /// Returns `BookshelfError::Validation` if a present field is malformed.
    pub fn validate_for_update(&self) -> Result<(), BookshelfError> {
        if self.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(BookshelfError::Validation(
                "title cannot be blank".to_string(),
            ));
        }
        self.validate_fields()
    }

    fn validate_fields(&self) -> Result<(), BookshelfError> {
        check_len("title", self.title.as_deref(), MAX_FIELD_CHARS)?;
        check_len("author", self.author.as_deref(), MAX_FIELD_CHARS)?;
        check_len(
            "publishedDate",
            self.published_date.as_deref(),
            MAX_FIELD_CHARS,
        )?;
        check_len(
            "description",
            self.description.as_deref(),
            MAX_DESCRIPTION_CHARS,
        )?;

        for key in self.extra.keys() {
            if key.is_empty() || key.chars().count() > MAX_EXTRA_KEY_CHARS {
                return Err(BookshelfError::Validation(format!(
                    "extra field name {key:?} must be 1-{MAX_EXTRA_KEY_CHARS} characters"
                )));
            }
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(BookshelfError::Validation(format!(
                    "field {key:?} cannot be set directly"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_new_book(self, caller: Option<&CallerIdentity>) -> NewBook {
        let (created_by, created_by_id) = match caller {
            Some(c) => (c.display_name.clone(), c.id.clone()),
            None => (ANONYMOUS_DISPLAY_NAME.to_string(), ANONYMOUS_ID.to_string()),
        };
        NewBook {
            id: None,
            title: self.title.map(|t| t.trim().to_string()).unwrap_or_default(),
            author: self.author,
            published_date: self.published_date,
            description: self.description,
            created_by,
            created_by_id,
            image_url: None,
            annotations: None,
            extra: self.extra,
        }
    }

    pub(crate) fn into_patch(self) -> BookPatch {
        BookPatch {
            title: self.title.map(|t| t.trim().to_string()),
            author: self.author,
            published_date: self.published_date,
            description: self.description,
            image_url: None,
            annotations: AnnotationUpdate::Keep,
            extra: self.extra,
        }
    }
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), BookshelfError> {
    match value {
        Some(v) if v.chars().count() > max => Err(BookshelfError::Validation(format!(
            "{field} exceeds {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Identity handed over by the external auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub id: String,
    pub display_name: String,
}

impl CallerIdentity {
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// An uploaded file as received from the caller.
#[derive(Clone, PartialEq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: Option<String>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("bytes", &format_args!("{} bytes", self.bytes.len()))
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub books: Vec<Book>,
    /// `None` iff no further records remain.
    pub next_cursor: Option<String>,
}
