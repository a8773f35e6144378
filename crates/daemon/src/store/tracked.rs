// Store wrapper that bounds every call with a timeout and reports the outcome
// to dependency health.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{Document, DocumentStore, Query, StoreError, TxnWrite};
use crate::health::DependencyHealth;

pub struct TrackedStore<D> {
    inner: D,
    health: Arc<DependencyHealth>,
    timeout: Duration,
}

impl<D: DocumentStore> TrackedStore<D> {
    pub fn new(inner: D, health: Arc<DependencyHealth>, timeout: Duration) -> Self {
        Self { inner, health, timeout }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn health(&self) -> &Arc<DependencyHealth> {
        &self.health
    }

    async fn track<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        match &result {
            Err(e) if e.is_transient() => self.health.record_failure(e),
            _ => self.health.record_success(),
        }
        result
    }
}

impl<D: DocumentStore> DocumentStore for TrackedStore<D> {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.track(self.inner.get(collection, id)).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.track(self.inner.set(collection, id, data)).await
    }

    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.track(self.inner.merge(collection, id, fields)).await
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.track(self.inner.create(collection, id, data)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.track(self.inner.delete(collection, id)).await
    }

    async fn transact<T, F>(&self, collection: &str, id: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<Value>) -> Result<(TxnWrite, T), StoreError> + Send + 'static,
    {
        self.track(self.inner.transact(collection, id, f)).await
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError> {
        self.track(self.inner.query(collection, query)).await
    }
}
