/// Bookshelf - the storage core of a book catalogue.
///
/// Book records carry bibliographic fields, an optional cover image, and the labels an
/// image-classification service detected on that image. This crate persists them behind a
/// swappable metadata backend and sequences the three external calls a create or update
/// needs:
/// 1. Upload the cover to a blob store and obtain its URL
/// 2. Ask the annotation service to label the image
/// 3. Write the record, with URL and labels, to the metadata backend
///
/// # Architecture
///
/// - `adapters::persistence` holds the backend contract and its in-memory, SQLite
///   (sqlx), and DynamoDB implementations, plus the opaque pagination cursor
/// - `clients` holds the S3 and in-memory blob stores and the Cloud Vision label client
/// - `features::books` holds the workflow orchestrator
///
/// # Example
///
/// ```no_run
/// use bookshelf::core::config::AppConfig;
/// use bookshelf::core::models::{BookForm, CallerIdentity};
/// use bookshelf::features::books::{BookRequest, Bookshelf};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     bookshelf::setup_logging();
///
///     let config = AppConfig::from_env()?;
///     let shelf = Bookshelf::from_config(&config).await?;
///
///     let caller = CallerIdentity::new("u1", "Ada");
///     let outcome = shelf
///         .create(BookRequest::new(BookForm::titled("Dune")), Some(&caller))
///         .await?;
///     println!("Created {} after {:?}", outcome.book.id, outcome.steps);
///
///     let page = shelf.list_by("u1", None, None).await?;
///     println!("{} book(s), more: {}", page.books.len(), page.next_cursor.is_some());
///     Ok(())
/// }
/// ```
// Module declarations
pub mod adapters;
pub mod clients;
pub mod core;
pub mod errors;
pub mod features;
pub mod utils;

pub use errors::BookshelfError;
pub use features::books::Bookshelf;

/// Configure structured logging with JSON output.
///
/// Verbosity follows `RUST_LOG` and defaults to `info`. Calling this more than once is
/// harmless; only the first call installs a subscriber.
///
/// # Example
///
/// ```
/// bookshelf::setup_logging();
/// ```
pub fn setup_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
