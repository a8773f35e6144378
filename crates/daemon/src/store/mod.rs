// Durable document store: collections of JSON documents with single-document
// transactions and ordered, limited queries.

pub mod memory;
pub mod sqlite;
pub mod tracked;

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use tracked::TrackedStore;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("document {collection}/{id} is corrupt: {reason}")]
    Corrupt { collection: String, id: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl StoreError {
    /// Transient failures count against dependency health; the rest are
    /// data outcomes the caller handles.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub(crate) fn already_exists(collection: &str, id: &str) -> Self {
        Self::AlreadyExists { collection: collection.into(), id: id.into() }
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound { collection: collection.into(), id: id.into() }
    }

    pub fn corrupt(collection: &str, id: &str, reason: impl ToString) -> Self {
        Self::Corrupt { collection: collection.into(), id: id.into(), reason: reason.to_string() }
    }
}

// ── Query shape ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
        }
    }
}

/// A single top-level field predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Equality/range filters, ascending order on one field, optional limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter { field: field.into(), op, value: value.into() });
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document body passes every filter.
    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|f| {
            body.get(&f.field)
                .and_then(|v| compare_values(v, &f.value))
                .is_some_and(|ord| f.op.accepts(ord))
        })
    }
}

/// Order two JSON scalars of the same kind; mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A stored document with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| StoreError::corrupt(collection, &self.id, e))
    }
}

/// What a transaction closure wants done with the document it observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnWrite {
    Keep,
    Put(Value),
    Delete,
}

// ── Store trait ─────────────────────────────────────────────────────

/// Abstraction over the durable document store.
///
/// All methods return `Send` futures so callers can run on a multi-threaded
/// runtime. `transact` runs its closure against the current value of one
/// document and applies the returned write atomically: no other write to that
/// document can land between the read and the write.
pub trait DocumentStore: Send + Sync + 'static {
    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Overwrite (or create) a document.
    fn set(
        &self,
        collection: &str,
        id: &str,
        data: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Shallow-merge top-level fields into an existing document.
    fn merge(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create a document; `AlreadyExists` if present.
    fn create(
        &self,
        collection: &str,
        id: &str,
        data: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a document. Returns whether it existed.
    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn transact<T, F>(
        &self,
        collection: &str,
        id: &str,
        f: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send + 'static,
        F: FnOnce(Option<Value>) -> Result<(TxnWrite, T), StoreError> + Send + 'static;

    fn query(
        &self,
        collection: &str,
        query: Query,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;
}

/// Several owners (simulated instances in tests, tracked wrappers) can share
/// one store.
impl<D: DocumentStore> DocumentStore for Arc<D> {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        (**self).set(collection, id, data).await
    }

    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        (**self).merge(collection, id, fields).await
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        (**self).create(collection, id, data).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        (**self).delete(collection, id).await
    }

    async fn transact<T, F>(&self, collection: &str, id: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<Value>) -> Result<(TxnWrite, T), StoreError> + Send + 'static,
    {
        (**self).transact(collection, id, f).await
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError> {
        (**self).query(collection, query).await
    }
}

// ── Typed helpers ───────────────────────────────────────────────────

pub async fn get_typed<D, T>(store: &D, collection: &str, id: &str) -> Result<Option<T>, StoreError>
where
    D: DocumentStore,
    T: DeserializeOwned,
{
    match store.get(collection, id).await? {
        Some(value) => {
            serde_json::from_value(value).map(Some).map_err(|e| StoreError::corrupt(collection, id, e))
        }
        None => Ok(None),
    }
}

pub fn encode<T: Serialize>(collection: &str, id: &str, doc: &T) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(|e| StoreError::corrupt(collection, id, e))
}

/// Shallow merge of `fields` into `target` (both JSON objects).
pub(crate) fn merge_fields(target: &mut Value, fields: Value) {
    match (target.as_object_mut(), fields) {
        (Some(obj), Value::Object(patch)) => {
            for (k, v) in patch {
                obj.insert(k, v);
            }
        }
        (_, replacement) => *target = replacement,
    }
}

/// Field names are restricted so they can be embedded in a JSON path.
pub(crate) fn valid_field(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_matches_equality_and_range() {
        let doc = json!({ "status": "PENDING", "nextAttemptAt": 100 });
        let q = Query::new()
            .filter("status", FilterOp::Eq, "PENDING")
            .filter("nextAttemptAt", FilterOp::Lte, 100);
        assert!(q.matches(&doc));

        let q = Query::new().filter("nextAttemptAt", FilterOp::Lt, 100);
        assert!(!q.matches(&doc));
    }

    #[test]
    fn missing_or_mismatched_fields_never_match() {
        let doc = json!({ "status": "PENDING" });
        assert!(!Query::new().filter("sentAt", FilterOp::Lt, 5).matches(&doc));
        assert!(!Query::new().filter("status", FilterOp::Eq, 1).matches(&doc));
    }

    #[test]
    fn merge_fields_is_shallow() {
        let mut doc = json!({ "a": 1, "nested": { "x": 1, "y": 2 } });
        merge_fields(&mut doc, json!({ "b": 2, "nested": { "x": 9 } }));
        assert_eq!(doc, json!({ "a": 1, "b": 2, "nested": { "x": 9 } }));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::already_exists("a", "b").is_transient());
        assert!(!StoreError::corrupt("a", "b", "bad").is_transient());
    }

    #[test]
    fn field_names_are_restricted() {
        assert!(valid_field("nextAttemptAt"));
        assert!(!valid_field("a.b"));
        assert!(!valid_field("x') OR 1=1 --"));
        assert!(!valid_field(""));
    }
}
