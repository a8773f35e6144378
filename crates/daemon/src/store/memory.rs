// In-process document store. Shared through `Arc` it stands in for one durable
// store seen by several simulated instances.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{
    compare_values, merge_fields, Document, DocumentStore, Query, StoreError, TxnWrite,
};

type Key = (String, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<Key, Value>>,
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn inject_failures(&self, n: u32) {
        self.fail_next.store(n, AtomicOrdering::SeqCst);
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.lock().keys().filter(|(c, _)| c == collection).count()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, Value>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let took = self
            .fail_next
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

fn key(collection: &str, id: &str) -> Key {
    (collection.to_string(), id.to_string())
}

impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        Ok(self.lock().get(&key(collection, id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().insert(key(collection, id), data);
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.check_available()?;
        let mut docs = self.lock();
        let doc =
            docs.get_mut(&key(collection, id)).ok_or_else(|| StoreError::not_found(collection, id))?;
        merge_fields(doc, fields);
        Ok(())
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check_available()?;
        let mut docs = self.lock();
        let k = key(collection, id);
        if docs.contains_key(&k) {
            return Err(StoreError::already_exists(collection, id));
        }
        docs.insert(k, data);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.lock().remove(&key(collection, id)).is_some())
    }

    async fn transact<T, F>(&self, collection: &str, id: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<Value>) -> Result<(TxnWrite, T), StoreError> + Send + 'static,
    {
        self.check_available()?;
        let mut docs = self.lock();
        let k = key(collection, id);
        let (write, out) = f(docs.get(&k).cloned())?;
        match write {
            TxnWrite::Keep => {}
            TxnWrite::Put(value) => {
                docs.insert(k, value);
            }
            TxnWrite::Delete => {
                docs.remove(&k);
            }
        }
        Ok(out)
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        let docs = self.lock();
        let mut matched: Vec<Document> = docs
            .iter()
            .filter(|((c, _), body)| c == collection && query.matches(body))
            .map(|((_, id), body)| Document { id: id.clone(), data: body.clone() })
            .collect();
        drop(docs);

        if let Some(field) = &query.order_by {
            matched.sort_by(|a, b| match (a.data.get(field), b.data.get(field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}
