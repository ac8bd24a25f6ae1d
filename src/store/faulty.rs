//! A [`LocalBackend`] wrapper that fails on demand, for exercising error
//! paths in the dashboards.

use async_trait::async_trait;
use serde_json::Value;

use super::{Backend, LocalBackend, Query, StoreError};

pub struct Faulty {
    pub inner: LocalBackend,
    /// Inserts into this table answer a 500.
    pub failing_inserts: Option<&'static str>,
    /// Every count answers zero, as if a concurrent write had not landed yet.
    pub stale_counts: bool,
}

impl Faulty {
    pub fn new(inner: LocalBackend) -> Self {
        Self { inner, failing_inserts: None, stale_counts: false }
    }
}

#[async_trait]
impl Backend for Faulty {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        self.inner.select(query).await
    }

    async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        if self.stale_counts {
            return Ok(0);
        }
        self.inner.count(query).await
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        if self.failing_inserts == Some(table) {
            return Err(StoreError::Remote { status: 500, message: format!("{table} is read-only") });
        }
        self.inner.insert(table, row).await
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<Value, StoreError> {
        self.inner.upsert(table, row, on_conflict).await
    }

    async fn update(&self, query: &Query, changes: Value) -> Result<usize, StoreError> {
        self.inner.update(query, changes).await
    }

    async fn delete(&self, query: &Query) -> Result<usize, StoreError> {
        self.inner.delete(query).await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.inner.upload(bucket, path, bytes, content_type).await
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StoreError> {
        self.inner.remove(bucket, paths).await
    }

    async fn signed_url(&self, bucket: &str, path: &str, expires_in: u64) -> Result<String, StoreError> {
        self.inner.signed_url(bucket, path, expires_in).await
    }

    async fn open_signed(
        &self,
        bucket: &str,
        path: &str,
        expires: i64,
        token: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.inner.open_signed(bucket, path, expires, token).await
    }
}
