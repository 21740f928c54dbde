//! Metadata backend adapters.
//!
//! Every adapter implements [`BookStore`], so the workflow layer never knows which storage
//! technology is active. The adapter is picked once at start-up by [`connect`] from the
//! `DATA_BACKEND` setting.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::models::{Book, BookPatch, NewBook, Page};
use crate::errors::StoreError;

pub mod cursor;
pub mod dynamodb;
pub mod memory;
pub mod sqlite;

pub use cursor::CursorCodec;
pub use dynamodb::DynamoBookStore;
pub use memory::MemoryBookStore;
pub use sqlite::SqliteBookStore;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 10;
/// Largest page any adapter will return.
pub const MAX_PAGE_SIZE: usize = 100;

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());

/// CRUD and pagination contract shared by all metadata backends.
///
/// Implementations must be safe to share between concurrent callers. No locking is
/// promised across calls: concurrent updates to one id are last-write-wins.
#[async_trait]
pub trait BookStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Persists a new record, assigning an id when `book.id` is `None`.
    async fn create(&self, book: NewBook) -> Result<Book, StoreError>;

    async fn read(&self, id: &str) -> Result<Book, StoreError>;

    /// Merges `patch` onto the stored record; absent fields are preserved.
    async fn update(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Records created by `owner_id`, in creation order, at most `limit` per page.
    async fn list_by(
        &self,
        owner_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError>;

    /// All records, in the backend's stable order, at most `limit` per page.
    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<Page, StoreError>;
}

pub type BookStoreRef = Arc<dyn BookStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Sqlite,
    #[serde(rename = "dynamodb")]
    DynamoDb,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Sqlite => "sqlite",
            BackendKind::DynamoDb => "dynamodb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmemory" => Ok(BackendKind::Memory),
            "sqlite" | "sql" | "cloudsql" => Ok(BackendKind::Sqlite),
            "dynamodb" | "dynamo" | "datastore" => Ok(BackendKind::DynamoDb),
            other => Err(format!("unknown data backend {other:?}")),
        }
    }
}

/// # Errors
///
/// Returns `StoreError::InvalidId` unless `id` is 1-128 characters of `[A-Za-z0-9_-]`.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// # Errors
///
/// Returns `StoreError::InvalidLimit` when `limit` is outside `1..=MAX_PAGE_SIZE`.
pub fn validate_limit(limit: usize) -> Result<(), StoreError> {
    if (1..=MAX_PAGE_SIZE).contains(&limit) {
        Ok(())
    } else {
        Err(StoreError::InvalidLimit(limit))
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Builds the adapter selected by `config.data_backend`.
///
/// # Errors
///
/// Returns an error if the selected backend cannot be reached or initialised.
pub async fn connect(config: &AppConfig) -> Result<BookStoreRef, StoreError> {
    let secret = config.cursor_secret.as_deref();
    let store: BookStoreRef = match config.data_backend {
        BackendKind::Memory => Arc::new(MemoryBookStore::new(CursorCodec::new(
            BackendKind::Memory,
            secret,
        ))),
        BackendKind::Sqlite => Arc::new(
            SqliteBookStore::connect(
                &config.sqlite_url,
                CursorCodec::new(BackendKind::Sqlite, secret),
            )
            .await?,
        ),
        BackendKind::DynamoDb => Arc::new(
            DynamoBookStore::from_config(
                config,
                CursorCodec::new(BackendKind::DynamoDb, secret),
            )
            .await,
        ),
    };
    info!(backend = %store.kind(), "Metadata backend ready");
    Ok(store)
}
