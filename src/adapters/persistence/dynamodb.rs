//! Document-store backend on DynamoDB.
//!
//! Table layout: partition key `id` (S). Owner listings query a global secondary index with
//! partition key `createdById` (S) and sort key `createdAt` (S, fixed-width RFC 3339 so that
//! lexical order is creation order). Cursors carry the key attributes of the last returned
//! item and are replayed as `ExclusiveStartKey`.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BackendKind, BookStore, CursorCodec, new_id, validate_id, validate_limit};
use crate::core::config::AppConfig;
use crate::core::models::{Annotation, Book, BookPatch, NewBook, Page};
use crate::errors::{StoreError, aws_error_is_transient};

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ItemKey {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

impl ItemKey {
    fn from_item(item: &Item, with_index: bool) -> Result<Self, StoreError> {
        Ok(Self {
            id: get_s(item, "id")?,
            owner: with_index.then(|| get_s(item, "createdById")).transpose()?,
            created_at: with_index.then(|| get_s(item, "createdAt")).transpose()?,
        })
    }

    fn into_item(self) -> Item {
        let mut key = Item::new();
        key.insert("id".to_string(), AttributeValue::S(self.id));
        if let Some(owner) = self.owner {
            key.insert("createdById".to_string(), AttributeValue::S(owner));
        }
        if let Some(created_at) = self.created_at {
            key.insert("createdAt".to_string(), AttributeValue::S(created_at));
        }
        key
    }
}

#[derive(Debug, Clone)]
pub struct DynamoBookStore {
    client: DynamoClient,
    table: String,
    owner_index: String,
    cursors: CursorCodec,
}

impl DynamoBookStore {
    #[must_use]
    pub fn new(
        client: DynamoClient,
        table: impl Into<String>,
        owner_index: impl Into<String>,
        cursors: CursorCodec,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            owner_index: owner_index.into(),
            cursors,
        }
    }

    /// Builds a client from the ambient AWS configuration, honouring `DYNAMODB_ENDPOINT_URL`.
    pub async fn from_config(config: &AppConfig, cursors: CursorCodec) -> Self {
        let shared = aws_config::from_env().load().await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &config.dynamodb_endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let client = DynamoClient::from_conf(builder.build());
        info!(
            table = %config.dynamodb_table,
            index = %config.dynamodb_owner_index,
            "Using DynamoDB metadata store"
        );
        Self::new(
            client,
            config.dynamodb_table.clone(),
            config.dynamodb_owner_index.clone(),
            cursors,
        )
    }

    async fn put(&self, book: &Book, condition: &str) -> Result<(), PutFailure> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(book_to_item(book)?))
            .condition_expression(condition)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    PutFailure::Condition
                } else {
                    PutFailure::Store(sdk_failure("put_item", &e))
                }
            })?;
        Ok(())
    }

    async fn page(
        &self,
        owner: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        paginate(&self.cursors, owner, limit, cursor, move |start, remaining| {
            self.fetch_batch(owner, start, remaining)
        })
        .await
    }

    /// One `Query` (owner index) or `Scan` round trip.
    async fn fetch_batch(
        &self,
        owner: Option<&str>,
        start_key: Option<Item>,
        remaining: i32,
    ) -> Result<Batch, StoreError> {
        match owner {
            Some(owner_id) => {
                let out = self
                    .client
                    .query()
                    .table_name(&self.table)
                    .index_name(&self.owner_index)
                    .key_condition_expression("#owner = :owner")
                    .expression_attribute_names("#owner", "createdById")
                    .expression_attribute_values(":owner", AttributeValue::S(owner_id.to_string()))
                    .scan_index_forward(true)
                    .limit(remaining)
                    .set_exclusive_start_key(start_key)
                    .send()
                    .await
                    .map_err(|e| sdk_failure("query", &e))?;
                Ok((out.items.unwrap_or_default(), out.last_evaluated_key))
            }
            None => {
                let out = self
                    .client
                    .scan()
                    .table_name(&self.table)
                    .limit(remaining)
                    .set_exclusive_start_key(start_key)
                    .send()
                    .await
                    .map_err(|e| sdk_failure("scan", &e))?;
                Ok((out.items.unwrap_or_default(), out.last_evaluated_key))
            }
        }
    }
}

/// Items from one round trip plus the `LastEvaluatedKey` to resume from.
type Batch = (Vec<Item>, Option<Item>);

/// Assembles one page from as many round trips as it takes.
///
/// One extra item tells us whether another page exists. DynamoDB may stop short at its
/// 1 MB response cap, so batches are read until there are enough items or the index is done.
async fn paginate<F, Fut>(
    cursors: &CursorCodec,
    owner: Option<&str>,
    limit: usize,
    cursor: Option<&str>,
    mut fetch: F,
) -> Result<Page, StoreError>
where
    F: FnMut(Option<Item>, i32) -> Fut,
    Fut: Future<Output = Result<Batch, StoreError>>,
{
    validate_limit(limit)?;
    let mut start_key: Option<Item> = match cursor {
        Some(token) => Some(cursors.decode::<ItemKey>(owner, token)?.into_item()),
        None => None,
    };

    let wanted = limit + 1;
    let mut items: Vec<Item> = Vec::with_capacity(wanted);
    loop {
        let remaining = i32::try_from(wanted - items.len()).unwrap_or(i32::MAX);
        let (batch, last_key) = fetch(start_key.take(), remaining).await?;
        items.extend(batch);
        match last_key {
            Some(key) if items.len() < wanted => start_key = Some(key),
            _ => break,
        }
    }

    let has_more = items.len() > limit;
    items.truncate(limit);
    let next_cursor = match (has_more, items.last()) {
        (true, Some(last)) => {
            let key = ItemKey::from_item(last, owner.is_some())?;
            Some(cursors.encode(owner, &key)?)
        }
        _ => None,
    };
    debug!(returned = items.len(), has_more, "DynamoDB page fetched");

    Ok(Page {
        books: items
            .iter()
            .map(item_to_book)
            .collect::<Result<Vec<_>, _>>()?,
        next_cursor,
    })
}

enum PutFailure {
    Condition,
    Store(StoreError),
}

impl From<StoreError> for PutFailure {
    fn from(error: StoreError) -> Self {
        PutFailure::Store(error)
    }
}

#[async_trait]
impl BookStore for DynamoBookStore {
    fn kind(&self) -> BackendKind {
        BackendKind::DynamoDb
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
        match self.put(&saved, "attribute_not_exists(id)").await {
            Ok(()) => Ok(saved),
            Err(PutFailure::Condition) => Err(StoreError::Constraint(format!(
                "book {} already exists",
                saved.id
            ))),
            Err(PutFailure::Store(e)) => Err(e),
        }
    }

    async fn read(&self, id: &str) -> Result<Book, StoreError> {
        validate_id(id)?;
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| sdk_failure("get_item", &e))?;
        let item = out.item.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        item_to_book(&item)
    }

    async fn update(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        let mut book = self.read(id).await?;
        book.apply(patch, Utc::now());
        match self.put(&book, "attribute_exists(id)").await {
            Ok(()) => Ok(book),
            Err(PutFailure::Condition) => Err(StoreError::NotFound(id.to_string())),
            Err(PutFailure::Store(e)) => Err(e),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .condition_expression("attribute_exists(id)")
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    StoreError::NotFound(id.to_string())
                } else {
                    sdk_failure("delete_item", &e)
                }
            })?;
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

fn sdk_failure<E, R>(op: &str, error: &aws_sdk_dynamodb::error::SdkError<E, R>) -> StoreError
where
    E: aws_sdk_dynamodb::error::ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("dynamodb {op}: {}", DisplayErrorContext(error));
    if aws_error_is_transient(error) {
        StoreError::Unavailable(message)
    } else {
        StoreError::Backend(message)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn book_to_item(book: &Book) -> Result<Item, StoreError> {
    let mut item = Item::new();
    item.insert("id".to_string(), AttributeValue::S(book.id.clone()));
    item.insert("title".to_string(), AttributeValue::S(book.title.clone()));
    let optional = [
        ("author", &book.author),
        ("publishedDate", &book.published_date),
        ("description", &book.description),
        ("imageUrl", &book.image_url),
    ];
    for (name, value) in optional {
        if let Some(v) = value {
            item.insert(name.to_string(), AttributeValue::S(v.clone()));
        }
    }
    item.insert(
        "createdBy".to_string(),
        AttributeValue::S(book.created_by.clone()),
    );
    item.insert(
        "createdById".to_string(),
        AttributeValue::S(book.created_by_id.clone()),
    );
    if let Some(annotations) = &book.annotations {
        let list = annotations
            .iter()
            .map(|a| {
                AttributeValue::M(HashMap::from([
                    ("label".to_string(), AttributeValue::S(a.label.clone())),
                    (
                        "confidence".to_string(),
                        AttributeValue::N(a.confidence.to_string()),
                    ),
                ]))
            })
            .collect();
        item.insert("annotations".to_string(), AttributeValue::L(list));
    }
    if !book.extra.is_empty() {
        item.insert(
            "extra".to_string(),
            AttributeValue::S(serde_json::to_string(&book.extra)?),
        );
    }
    item.insert(
        "createdAt".to_string(),
        AttributeValue::S(timestamp(&book.created_at)),
    );
    item.insert(
        "updatedAt".to_string(),
        AttributeValue::S(timestamp(&book.updated_at)),
    );
    Ok(item)
}

fn get_s(item: &Item, name: &str) -> Result<String, StoreError> {
    get_opt_s(item, name)?
        .ok_or_else(|| StoreError::Backend(format!("stored item is missing {name}")))
}

fn get_opt_s(item: &Item, name: &str) -> Result<Option<String>, StoreError> {
    match item.get(name) {
        None | Some(AttributeValue::Null(_)) => Ok(None),
        Some(AttributeValue::S(s)) => Ok(Some(s.clone())),
        Some(_) => Err(StoreError::Backend(format!(
            "stored attribute {name} is not a string"
        ))),
    }
}

fn get_time(item: &Item, name: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = get_s(item, name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("stored {name} is not RFC 3339: {e}")))
}

fn get_annotations(item: &Item) -> Result<Option<Vec<Annotation>>, StoreError> {
    let Some(value) = item.get("annotations") else {
        return Ok(None);
    };
    let list = value
        .as_l()
        .map_err(|_| StoreError::Backend("stored annotations are not a list".to_string()))?;
    list.iter()
        .map(|entry| {
            let map = entry
                .as_m()
                .map_err(|_| StoreError::Backend("stored annotation is not a map".to_string()))?;
            let label = get_s(map, "label")?;
            let confidence = map
                .get("confidence")
                .and_then(|v| v.as_n().ok())
                .and_then(|n| n.parse::<f32>().ok())
                .ok_or_else(|| {
                    StoreError::Backend("stored annotation confidence is not a number".to_string())
                })?;
            Ok(Annotation { label, confidence })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn item_to_book(item: &Item) -> Result<Book, StoreError> {
    Ok(Book {
        id: get_s(item, "id")?,
        title: get_s(item, "title")?,
        author: get_opt_s(item, "author")?,
        published_date: get_opt_s(item, "publishedDate")?,
        description: get_opt_s(item, "description")?,
        created_by: get_s(item, "createdBy")?,
        created_by_id: get_s(item, "createdById")?,
        image_url: get_opt_s(item, "imageUrl")?,
        annotations: get_annotations(item)?,
        extra: match get_opt_s(item, "extra")? {
            Some(json) => serde_json::from_str(&json)?,
            None => Default::default(),
        },
        created_at: get_time(item, "createdAt")?,
        updated_at: get_time(item, "updatedAt")?,
    })
}
