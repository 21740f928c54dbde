use std::time::Duration;

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

use crate::adapters::persistence::MAX_PAGE_SIZE;
use crate::features::books::WorkflowStep;

/// Errors raised by a metadata backend adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Book not found: {0}")]
    NotFound(String),

    #[error("Malformed book identifier: {0:?}")]
    InvalidId(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid pagination cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid page size {0}: expected 1..={max}", max = MAX_PAGE_SIZE)]
    InvalidLimit(usize),

    #[error("Metadata store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the caller may retry the same call unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if let Some(db) = error.as_database_error() {
            if db.is_unique_violation() {
                return StoreError::Constraint(db.message().to_string());
            }
            // SQLITE_BUSY / SQLITE_LOCKED
            if matches!(db.code().as_deref(), Some("5") | Some("6")) {
                return StoreError::Unavailable(db.message().to_string());
            }
        }
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(error.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Backend(format!("Failed to (de)serialize stored field: {error}"))
    }
}

/// Errors raised by a blob uploader.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid attachment: {0}")]
    Validation(String),

    #[error("Failed to reach blob store: {0}")]
    Transport(String),

    #[error("Blob store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Blob store rejected the request: {0}")]
    Rejected(String),
}

impl UploadError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transport(_) | UploadError::Timeout(_))
    }
}

/// Errors raised by a label detection client.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Failed to reach annotation service: {0}")]
    Transport(String),

    #[error("Annotation service call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Annotation service returned an error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("Failed to parse annotation response: {0}")]
    InvalidResponse(String),
}

impl AnnotationError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnnotationError::Transport(_) | AnnotationError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for AnnotationError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            AnnotationError::InvalidResponse(error.to_string())
        } else {
            AnnotationError::Transport(error.to_string())
        }
    }
}

/// The single error surfaced to callers of the book workflows.
#[derive(Debug, Error)]
pub enum BookshelfError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Book not found: {0}")]
    NotFound(String),

    #[error("{action} failed during {step} (retryable): {message}")]
    Transient {
        step: WorkflowStep,
        action: &'static str,
        message: String,
    },

    #[error("{action} failed during {step}: {message}")]
    Permanent {
        step: WorkflowStep,
        action: &'static str,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BookshelfError {
    /// Whether the whole workflow may be retried from `Received`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookshelfError::Transient { .. })
    }

    /// The workflow step the failure happened in, if it came from an external call.
    #[must_use]
    pub fn step(&self) -> Option<WorkflowStep> {
        match self {
            BookshelfError::Transient { step, .. } | BookshelfError::Permanent { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }

    pub(crate) fn from_store(step: WorkflowStep, error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => BookshelfError::NotFound(id),
            StoreError::InvalidId(_)
            | StoreError::InvalidCursor(_)
            | StoreError::InvalidLimit(_) => BookshelfError::Validation(error.to_string()),
            e if e.is_transient() => BookshelfError::Transient {
                step,
                action: "metadata store",
                message: e.to_string(),
            },
            e => BookshelfError::Permanent {
                step,
                action: "metadata store",
                message: e.to_string(),
            },
        }
    }

    pub(crate) fn from_upload(step: WorkflowStep, error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => BookshelfError::Validation(msg),
            e if e.is_transient() => BookshelfError::Transient {
                step,
                action: "upload",
                message: e.to_string(),
            },
            e => BookshelfError::Permanent {
                step,
                action: "upload",
                message: e.to_string(),
            },
        }
    }

    pub(crate) fn from_annotation(step: WorkflowStep, error: AnnotationError) -> Self {
        if error.is_transient() {
            BookshelfError::Transient {
                step,
                action: "annotation",
                message: error.to_string(),
            }
        } else {
            BookshelfError::Permanent {
                step,
                action: "annotation",
                message: error.to_string(),
            }
        }
    }
}

impl From<anyhow::Error> for BookshelfError {
    fn from(error: anyhow::Error) -> Self {
        // `{:#}` keeps the whole context chain on one line.
        BookshelfError::Config(format!("{error:#}"))
    }
}

const TRANSIENT_AWS_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "InternalServerError",
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
    "RequestTimeout",
];

/// Classifies an AWS SDK failure as transient (network, throttling, 5xx) or not.
///
/// Both S3 and DynamoDB share the smithy `SdkError` type, so one helper serves both.
pub(crate) fn aws_error_is_transient<E, R>(error: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => service
            .err()
            .code()
            .is_some_and(|code| TRANSIENT_AWS_CODES.contains(&code)),
        _ => false,
    }
}
