//! In-process backend. Records live in insertion order keyed by a sequence number, which
//! doubles as the cursor position.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BackendKind, BookStore, CursorCodec, new_id, validate_id, validate_limit};
use crate::core::models::{Book, BookPatch, NewBook, Page};
use crate::errors::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    by_seq: BTreeMap<u64, Book>,
    seq_by_id: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct MemoryBookStore {
    state: RwLock<MemoryState>,
    cursors: CursorCodec,
}

impl MemoryBookStore {
    #[must_use]
    pub fn new(cursors: CursorCodec) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            cursors,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_seq.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn page(
        &self,
        owner: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        validate_limit(limit)?;
        let after = match cursor {
            Some(token) => Bound::Excluded(self.cursors.decode::<u64>(owner, token)?),
            None => Bound::Unbounded,
        };

        let state = self.state.read().await;
        let mut rows: Vec<(u64, &Book)> = state
            .by_seq
            .range((after, Bound::Unbounded))
            .filter(|(_, book)| owner.is_none_or(|o| book.created_by_id == o))
            .take(limit + 1)
            .map(|(seq, book)| (*seq, book))
            .collect();

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = match (has_more, rows.last()) {
            (true, Some((seq, _))) => Some(self.cursors.encode(owner, seq)?),
            _ => None,
        };

        Ok(Page {
            books: rows.into_iter().map(|(_, book)| book.clone()).collect(),
            next_cursor,
        })
    }
}

#[async_trait]
impl BookStore for MemoryBookStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn create(&self, book: NewBook) -> Result<Book, StoreError> {
        let id = match &book.id {
            Some(id) => {
                validate_id(id)?;
                id.clone()
            }
            None => new_id(),
        };

        let mut state = self.state.write().await;
        if state.seq_by_id.contains_key(&id) {
            return Err(StoreError::Constraint(format!("book {id} already exists")));
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        let saved = book.into_book(id.clone(), Utc::now());
        state.by_seq.insert(seq, saved.clone());
        state.seq_by_id.insert(id, seq);
        debug!(id = %saved.id, seq, "Stored book in memory");
        Ok(saved)
    }

    async fn read(&self, id: &str) -> Result<Book, StoreError> {
        validate_id(id)?;
        let state = self.state.read().await;
        state
            .seq_by_id
            .get(id)
            .and_then(|seq| state.by_seq.get(seq))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        validate_id(id)?;
        let mut state = self.state.write().await;
        let seq = *state
            .seq_by_id
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let book = state
            .by_seq
            .get_mut(&seq)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        book.apply(patch, Utc::now());
        Ok(book.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let mut state = self.state.write().await;
        let seq = state
            .seq_by_id
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        state.by_seq.remove(&seq);
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
