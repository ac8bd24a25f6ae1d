//! Access to the backend-as-a-service: row queries and object storage.
//!
//! [`Backend`] is the seam between the dashboards and wherever the data
//! actually lives. [`rest::RestBackend`] speaks to the hosted service,
//! [`local::LocalBackend`] keeps everything in a directory on disk.

use std::cmp::Ordering;

use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
pub mod faulty;
pub mod local;
pub mod rest;

pub use local::LocalBackend;
pub use rest::RestBackend;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate value violates unique constraint: {0}")]
    Conflict(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid or expired signature")]
    InvalidSignature,

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("operation not supported by this backend")]
    Unsupported,

    #[error("backend request failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single row filter.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    /// Evaluates the filter against a JSON row. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(column, expected) => match row.get(column) {
                Some(actual) => loose_eq(actual, expected),
                None => expected.is_null(),
            },
            Filter::Gte(column, bound) => row
                .get(column)
                .filter(|actual| !actual.is_null())
                .is_some_and(|actual| compare_values(actual, bound) != Ordering::Less),
            Filter::In(column, candidates) => row
                .get(column)
                .is_some_and(|actual| candidates.iter().any(|c| loose_eq(actual, c))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A row-level query against one table.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub filters: Vec<Filter>,
    pub order: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: None,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    /// Adds an equality filter only when a value is present.
    pub fn eq_opt(self, column: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.eq(column, value),
            None => self,
        }
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(column.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.push(Filter::In(column.to_string(), values));
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }
}

/// Everything the dashboards need from the backend-as-a-service.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, query: &Query) -> Result<usize, StoreError>;

    /// Inserts one row and returns it as stored (with generated columns).
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError>;

    /// Inserts or merges a row, matching existing rows on the
    /// comma-separated `on_conflict` columns.
    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<Value, StoreError>;

    /// Merges `changes` into every matching row; returns how many changed.
    async fn update(&self, query: &Query, changes: Value) -> Result<usize, StoreError>;

    async fn delete(&self, query: &Query) -> Result<usize, StoreError>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StoreError>;

    /// A time-limited download URL for one object.
    async fn signed_url(&self, bucket: &str, path: &str, expires_in: u64) -> Result<String, StoreError>;

    /// Resolves a URL produced by [`Backend::signed_url`] back to the
    /// object bytes. Only backends that serve their own objects support it.
    async fn open_signed(
        &self,
        _bucket: &str,
        _path: &str,
        _expires: i64,
        _token: &str,
    ) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Unsupported)
    }
}

/// Decodes rows into `T`, skipping (and logging) rows that do not fit.
pub fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Skipping malformed {table} row: {e}");
                None
            }
        })
        .collect()
}

/// Text form of a scalar used for filters and comparisons.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => scalar_text(a) == scalar_text(b),
    }
}

/// Orders numbers numerically and everything else by its text form, which
/// sorts ISO dates and timestamps chronologically. Nulls sort first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        _ => scalar_text(a).cmp(&scalar_text(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_matches_text_and_numbers_loosely() {
        let row = json!({ "id": 5, "role": "ALUMNO" });
        assert!(Filter::Eq("id".into(), json!("5")).matches(&row));
        assert!(Filter::Eq("role".into(), json!("ALUMNO")).matches(&row));
        assert!(!Filter::Eq("role".into(), json!("PROFESOR")).matches(&row));
    }

    #[test]
    fn eq_null_matches_missing_column() {
        let row = json!({ "id": 1 });
        assert!(Filter::Eq("gym_id".into(), Value::Null).matches(&row));
        assert!(!Filter::Eq("gym_id".into(), json!("g1")).matches(&row));
    }

    #[test]
    fn gte_compares_dates_as_text() {
        let row = json!({ "date": "2024-05-02" });
        assert!(Filter::Gte("date".into(), json!("2024-05-02")).matches(&row));
        assert!(Filter::Gte("date".into(), json!("2024-05-01")).matches(&row));
        assert!(!Filter::Gte("date".into(), json!("2024-05-03")).matches(&row));
        assert!(!Filter::Gte("date".into(), json!("2024-05-01")).matches(&json!({})));
    }

    #[test]
    fn in_filter_matches_any_candidate() {
        let query = Query::table("push_subscriptions").is_in("user_id", ["a", "b"]);
        assert!(query.matches(&json!({ "user_id": "b" })));
        assert!(!query.matches(&json!({ "user_id": "c" })));
    }

    #[test]
    fn eq_opt_skips_missing_values() {
        let query = Query::table("users").eq_opt("gym_id", None::<String>);
        assert!(query.filters.is_empty());
        let query = Query::table("users").eq_opt("gym_id", Some("g1"));
        assert_eq!(query.filters, vec![Filter::Eq("gym_id".into(), json!("g1"))]);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(10), &json!(9)), Ordering::Greater);
        assert_eq!(compare_values(&json!("10"), &json!("9")), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
    }

    #[test]
    fn decode_rows_skips_bad_rows() {
        #[derive(serde::Deserialize)]
        struct Row {
            #[allow(dead_code)]
            id: u32,
        }

        let rows = vec![json!({ "id": 1 }), json!({ "id": "x" }), json!({ "id": 3 })];
        let decoded: Vec<Row> = decode_rows("test", rows);
        assert_eq!(decoded.len(), 2);
    }
}
