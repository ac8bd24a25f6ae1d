use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response, header};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Backend, Filter, Order, Query, StoreError, scalar_text};
use crate::config::RemoteConfig;

/// Postgres error code for unique violations.
const UNIQUE_VIOLATION: &str = "23505";

/// The hosted backend: PostgREST rows under `/rest/v1` and the storage
/// API under `/storage/v1`, authenticated with the service key.
pub struct RestBackend {
    client: Client,
    url: String,
    key: String,
}

#[derive(Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SignedUrl {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl RestBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self, StoreError> {
        let client = Client::builder().user_agent("gymdesk/0.1").build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            key: config.service_key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.url))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    fn rows(&self, method: Method, table: &str) -> RequestBuilder {
        self.request(method, &format!("/rest/v1/{}", urlencoding::encode(table)))
    }

    fn object_url(bucket: &str, path: &str) -> String {
        let path = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{path}", urlencoding::encode(bucket))
    }
}

/// PostgREST query-string form of a query.
pub fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    if let Some(columns) = &query.columns {
        pairs.push(("select".to_string(), columns.join(",")));
    }

    for filter in &query.filters {
        pairs.push(match filter {
            Filter::Eq(column, Value::Null) => (column.clone(), "is.null".to_string()),
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", scalar_text(value))),
            Filter::Gte(column, value) => (column.clone(), format!("gte.{}", scalar_text(value))),
            Filter::In(column, values) => {
                let quoted: Vec<String> = values
                    .iter()
                    .map(|v| format!("\"{}\"", scalar_text(v).replace('"', "\\\"")))
                    .collect();
                (column.clone(), format!("in.({})", quoted.join(",")))
            }
        });
    }

    if let Some((column, order)) = &query.order {
        let direction = match order {
            Order::Asc => "asc",
            Order::Desc => "desc",
        };
        pairs.push(("order".to_string(), format!("{column}.{direction}")));
    }

    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }

    pairs
}

/// Total row count from a `Content-Range` header such as `0-9/42` or `*/0`.
pub fn parse_content_range(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.parse().ok()
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: Option<RemoteError> = serde_json::from_str(&body).ok();
    let code = parsed.as_ref().and_then(|e| e.code.clone());
    let message = parsed
        .and_then(|e| e.message.or(e.error))
        .unwrap_or(body);

    if code.as_deref() == Some(UNIQUE_VIOLATION) || status.as_u16() == 409 {
        return Err(StoreError::Conflict(message));
    }
    if status.as_u16() == 404 {
        return Err(StoreError::NotFound(message));
    }

    Err(StoreError::Remote {
        status: status.as_u16(),
        message,
    })
}

fn first_row(rows: Vec<Value>) -> Value {
    rows.into_iter().next().unwrap_or(Value::Null)
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        debug!("select {} {:?}", query.table, query.filters);
        let response = self
            .rows(Method::GET, &query.table)
            .query(&query_pairs(query))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        let response = self
            .rows(Method::HEAD, &query.table)
            .query(&query_pairs(query))
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check(response).await?;

        Ok(response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range)
            .unwrap_or(0))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let response = self
            .rows(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        Ok(first_row(check(response).await?.json().await?))
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<Value, StoreError> {
        let response = self
            .rows(Method::POST, table)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row)
            .send()
            .await?;
        Ok(first_row(check(response).await?.json().await?))
    }

    async fn update(&self, query: &Query, changes: Value) -> Result<usize, StoreError> {
        let response = self
            .rows(Method::PATCH, &query.table)
            .query(&query_pairs(query))
            .header("Prefer", "return=representation")
            .json(&changes)
            .send()
            .await?;
        let rows: Vec<Value> = check(response).await?.json().await?;
        Ok(rows.len())
    }

    async fn delete(&self, query: &Query) -> Result<usize, StoreError> {
        let response = self
            .rows(Method::DELETE, &query.table)
            .query(&query_pairs(query))
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows: Vec<Value> = check(response).await?.json().await?;
        Ok(rows.len())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &format!("/storage/v1/object/{}", Self::object_url(bucket, path)))
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, &format!("/storage/v1/object/{}", urlencoding::encode(bucket)))
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, expires_in: u64) -> Result<String, StoreError> {
        let response = self
            .request(
                Method::POST,
                &format!("/storage/v1/object/sign/{}", Self::object_url(bucket, path)),
            )
            .json(&json!({ "expiresIn": expires_in }))
            .send()
            .await?;
        let signed: SignedUrl = check(response).await?.json().await?;

        Ok(format!("{}/storage/v1{}", self.url, signed.signed_url))
    }
}
