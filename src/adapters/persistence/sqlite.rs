//! Relational backend on SQLite via `sqlx`.
//!
//! Rows carry an `AUTOINCREMENT` sequence column that defines creation order and is the
//! cursor position. Annotations and extra fields are stored as JSON text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{BackendKind, BookStore, CursorCodec, new_id, validate_id, validate_limit};
use crate::core::models::{Annotation, Book, BookPatch, NewBook, Page};
use crate::errors::StoreError;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    author TEXT,
    published_date TEXT,
    description TEXT,
    created_by TEXT NOT NULL,
    created_by_id TEXT NOT NULL,
    image_url TEXT,
    annotations TEXT,
    extra TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const CREATE_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS books_owner_seq ON books (created_by_id, seq)";

const SELECT_COLUMNS: &str = "seq, id, title, author, published_date, description, \
     created_by, created_by_id, image_url, annotations, extra, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteBookStore {
    pool: SqlitePool,
    cursors: CursorCodec,
}

impl SqliteBookStore {
    /// Opens (creating if needed) the database at `url` and ensures the schema exists.
    ///
    /// In-memory URLs are pinned to a single long-lived connection, since every SQLite
    /// memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database cannot be opened.
    pub async fn connect(url: &str, cursors: CursorCodec) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(format!("invalid SQLITE_URL {url:?}: {e}")))?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        let store = Self::from_pool(pool, cursors);
        store.migrate().await?;
        info!(url, "Connected to SQLite metadata store");
        Ok(store)
    }

    #[must_use]
    pub fn from_pool(pool: SqlitePool, cursors: CursorCodec) -> Self {
        Self { pool, cursors }
    }

    /// # Errors
    ///
    /// Returns an error if the schema statements fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_OWNER_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    fn map_row(row: &SqliteRow) -> Result<(i64, Book), StoreError> {
        let seq: i64 = row.try_get("seq")?;
        let annotations: Option<String> = row.try_get("annotations")?;
        let extra: String = row.try_get("extra")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        let annotations: Option<Vec<Annotation>> = annotations
            .map(|json| serde_json::from_str(&json))
            .transpose()?;

        let book = Book {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            author: row.try_get("author")?,
            published_date: row.try_get("published_date")?,
            description: row.try_get("description")?,
            created_by: row.try_get("created_by")?,
            created_by_id: row.try_get("created_by_id")?,
            image_url: row.try_get("image_url")?,
            annotations,
            extra: serde_json::from_str(&extra)?,
            created_at,
            updated_at,
        };
        Ok((seq, book))
    }

    async fn page(
        &self,
        owner: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        validate_limit(limit)?;
        let after: i64 = match cursor {
            Some(token) => self.cursors.decode(owner, token)?,
            None => 0,
        };

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM books \
             WHERE (?1 IS NULL OR created_by_id = ?1) AND seq > ?2 \
             ORDER BY seq LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(after)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut books = rows
            .iter()
            .map(Self::map_row)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = books.len() > limit;
        books.truncate(limit);
        let next_cursor = match (has_more, books.last()) {
            (true, Some((seq, _))) => Some(self.cursors.encode(owner, seq)?),
            _ => None,
        };
        debug!(returned = books.len(), has_more, "SQLite page fetched");

        Ok(Page {
            books: books.into_iter().map(|(_, book)| book).collect(),
            next_cursor,
        })
    }
}

#[async_trait]
impl BookStore for SqliteBookStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn create(&self, book: NewBook) -> Result<Book, StoreError> {
        let id = match &book.id {
            Some(id) => {
                validate_id(id)?;
                id.clone()
            }
            None => new_id(),
        };
        let saved = book.into_book(id, Utc::now());
        let annotations = saved
            .annotations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO books (
                id, title, author, published_date, description, created_by,
                created_by_id, image_url, annotations, extra, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&saved.id)
        .bind(&saved.title)
        .bind(&saved.author)
        .bind(&saved.published_date)
        .bind(&saved.description)
        .bind(&saved.created_by)
        .bind(&saved.created_by_id)
        .bind(&saved.image_url)
        .bind(annotations)
        .bind(serde_json::to_string(&saved.extra)?)
        .bind(saved.created_at)
        .bind(saved.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn read(&self, id: &str) -> Result<Book, StoreError> {
        validate_id(id)?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM books WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Self::map_row(&row).map(|(_, book)| book)
    }

    async fn update(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        validate_id(id)?;
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {SELECT_COLUMNS} FROM books WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (_, mut book) = Self::map_row(&row)?;
        book.apply(patch, Utc::now());

        let annotations = book
            .annotations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE books
            SET title = ?2, author = ?3, published_date = ?4, description = ?5,
                image_url = ?6, annotations = ?7, extra = ?8, updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(&book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.published_date)
        .bind(&book.description)
        .bind(&book.image_url)
        .bind(annotations)
        .bind(serde_json::to_string(&book.extra)?)
        .bind(book.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(book)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let result = sqlx::query("DELETE FROM books WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_by(
        &self,
        owner_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.page(Some(owner_id), limit, cursor).await
    }

    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<Page, StoreError> {
        self.page(None, limit, cursor).await
    }
}
