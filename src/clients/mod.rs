//! Client modules for external service interactions

use std::future::Future;
use std::time::Duration;

use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

pub mod blob;
pub mod s3;
pub mod vision;

pub use blob::{BlobMetadata, BlobUploader, MemoryBlobStore, ObjectNaming};
pub use s3::{S3BlobUploader, UrlStyle};
pub use vision::{ImageRef, LabelDetector, VisionClient};

/// Runs `operation`, retrying transient failures with jittered exponential backoff
/// (100ms, 200ms, 400ms, ... capped at 2s). `retries` is the number of extra attempts.
pub(crate) async fn with_retry<F, Fut, T, E>(
    retries: usize,
    operation: F,
    is_transient: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(50)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(retries);

    RetryIf::spawn(strategy, operation, |e: &E| is_transient(e)).await
}
