use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde_json::{Map, Value};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Backend, Order, Query, StoreError, compare_values, scalar_text};
use crate::models::{ATTENDANCES, PUSH_SUBSCRIPTIONS, USERS};

const TABLES_DIR: &str = "tables";
const STORAGE_DIR: &str = "storage";

type HmacSha256 = Hmac<Sha256>;

/// Column sets that must be unique per table.
fn unique_constraints(table: &str) -> &'static [&'static [&'static str]] {
    match table {
        USERS => &[&["username"]],
        PUSH_SUBSCRIPTIONS => &[&["user_id"]],
        ATTENDANCES => &[&["student_id", "date"]],
        _ => &[],
    }
}

/// Backend kept in a directory: one JSON array per table under `tables/`
/// and stored objects under `storage/{bucket}/`.
///
/// Signed URLs point back at this server (`/storage/{bucket}/{path}`) and
/// carry an expiry plus an HMAC-SHA256 token keyed with the signing secret.
pub struct LocalBackend {
    root: PathBuf,
    secret: Vec<u8>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl LocalBackend {
    pub async fn open(root: impl Into<PathBuf>, secret: Vec<u8>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(TABLES_DIR)).await?;
        fs::create_dir_all(root.join(STORAGE_DIR)).await?;
        info!("Local backend rooted at {}", root.display());

        Ok(Self {
            root,
            secret,
            tables: RwLock::new(HashMap::new()),
        })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(TABLES_DIR).join(format!("{table}.json"))
    }

    async fn load_table(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        let path = self.table_path(table);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(rows)?;
        fs::write(self.table_path(table), json).await?;
        Ok(())
    }

    /// Runs `f` against the rows of `table` with write access, persisting
    /// the result when `f` succeeds.
    async fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Vec<Value>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.contains_key(table) {
            let rows = self.load_table(table).await?;
            tables.insert(table.to_string(), rows);
        }

        let rows = tables.entry(table.to_string()).or_default();
        let mut working = rows.clone();
        let result = f(&mut working)?;
        self.persist(table, &working).await?;
        *rows = working;
        Ok(result)
    }

    async fn read_table(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        {
            let tables = self.tables.read().await;
            if let Some(rows) = tables.get(table) {
                return Ok(rows.clone());
            }
        }

        let rows = self.load_table(table).await?;
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_insert_with(|| rows.clone());
        Ok(rows)
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe || bucket.contains(['/', '\\']) || bucket.contains("..") {
            return Err(StoreError::InvalidPath(format!("{bucket}/{path}")));
        }

        Ok(self.root.join(STORAGE_DIR).join(bucket).join(relative))
    }

    /// Hex HMAC-SHA256 over bucket, path and expiry, keyed with the secret.
    fn sign(&self, bucket: &str, path: &str, expires: i64) -> Result<String, StoreError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| StoreError::InvalidSignature)?;
        mac.update(bucket.as_bytes());
        mac.update(&[0u8]);
        mac.update(path.as_bytes());
        mac.update(&[0u8]);
        mac.update(expires.to_string().as_bytes());
        Ok(format!("{:x}", mac.finalize().into_bytes()))
    }
}

/// Fills in `id` and `created_at` the way the hosted tables default them.
fn with_defaults(row: Value) -> Result<Map<String, Value>, StoreError> {
    let Value::Object(mut object) = row else {
        return Err(StoreError::Remote {
            status: 400,
            message: "row must be a JSON object".to_string(),
        });
    };

    if object.get("id").is_none_or(Value::is_null) {
        object.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    if object.get("created_at").is_none_or(Value::is_null) {
        object.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
    }

    Ok(object)
}

fn same_key(a: &Value, b: &Value, columns: &[&str]) -> bool {
    columns.iter().all(|column| {
        let left = a.get(*column).unwrap_or(&Value::Null);
        let right = b.get(*column).unwrap_or(&Value::Null);
        !left.is_null() && scalar_text(left) == scalar_text(right)
    })
}

/// Checks `candidate` (at `skip` when it is already in `rows`) against the
/// table's unique constraints.
fn check_unique(table: &str, rows: &[Value], candidate: &Value, skip: Option<usize>) -> Result<(), StoreError> {
    for columns in unique_constraints(table) {
        let clash = rows
            .iter()
            .enumerate()
            .any(|(index, row)| Some(index) != skip && same_key(row, candidate, columns));
        if clash {
            return Err(StoreError::Conflict(format!("{table}.{}", columns.join("+"))));
        }
    }
    Ok(())
}

fn merge(target: &mut Value, changes: &Value) {
    if let (Value::Object(target), Value::Object(changes)) = (target, changes) {
        for (key, value) in changes {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn project(row: &Value, columns: &Option<Vec<String>>) -> Value {
    match columns {
        None => row.clone(),
        Some(columns) => {
            let mut projected = Map::new();
            for column in columns {
                if let Some(value) = row.get(column) {
                    projected.insert(column.clone(), value.clone());
                }
            }
            Value::Object(projected)
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        let mut rows: Vec<Value> = self
            .read_table(&query.table)
            .await?
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();

        if let Some((column, order)) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                );
                match order {
                    Order::Asc => ordering,
                    Order::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows.iter().map(|row| project(row, &query.columns)).collect())
    }

    async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        Ok(self
            .read_table(&query.table)
            .await?
            .iter()
            .filter(|row| query.matches(row))
            .count())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let row = Value::Object(with_defaults(row)?);
        self.with_table(table, |rows| {
            check_unique(table, rows, &row, None)?;
            rows.push(row.clone());
            Ok(row)
        })
        .await
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<Value, StoreError> {
        let columns: Vec<&str> = on_conflict.split(',').map(str::trim).collect();
        self.with_table(table, |rows| {
            if let Some(index) = rows.iter().position(|existing| same_key(existing, &row, &columns)) {
                let mut merged = rows[index].clone();
                merge(&mut merged, &row);
                check_unique(table, rows, &merged, Some(index))?;
                rows[index] = merged.clone();
                return Ok(merged);
            }

            let inserted = Value::Object(with_defaults(row.clone())?);
            check_unique(table, rows, &inserted, None)?;
            rows.push(inserted.clone());
            Ok(inserted)
        })
        .await
    }

    async fn update(&self, query: &Query, changes: Value) -> Result<usize, StoreError> {
        let table = query.table.as_str();
        self.with_table(table, |rows| {
            let mut changed = 0;
            for index in 0..rows.len() {
                if !query.matches(&rows[index]) {
                    continue;
                }
                let mut updated = rows[index].clone();
                merge(&mut updated, &changes);
                check_unique(table, rows, &updated, Some(index))?;
                rows[index] = updated;
                changed += 1;
            }
            Ok(changed)
        })
        .await
    }

    async fn delete(&self, query: &Query) -> Result<usize, StoreError> {
        self.with_table(&query.table, |rows| {
            let before = rows.len();
            rows.retain(|row| !query.matches(row));
            Ok(before - rows.len())
        })
        .await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let target = self.object_path(bucket, path)?;
        if fs::try_exists(&target).await? {
            return Err(StoreError::Conflict(format!("{bucket}/{path}")));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
        debug!("Stored object {bucket}/{path}");
        Ok(())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StoreError> {
        for path in paths {
            let target = self.object_path(bucket, path)?;
            match fs::remove_file(&target).await {
                Ok(()) => debug!("Removed object {bucket}/{path}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, expires_in: u64) -> Result<String, StoreError> {
        self.object_path(bucket, path)?;
        let expires = Utc::now().timestamp() + expires_in as i64;
        let token = self.sign(bucket, path, expires)?;
        let encoded_path = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(format!(
            "/storage/{}/{encoded_path}?expires={expires}&token={token}",
            urlencoding::encode(bucket)
        ))
    }

    async fn open_signed(
        &self,
        bucket: &str,
        path: &str,
        expires: i64,
        token: &str,
    ) -> Result<Vec<u8>, StoreError> {
        if expires < Utc::now().timestamp() || self.sign(bucket, path, expires)? != token {
            return Err(StoreError::InvalidSignature);
        }

        let target = self.object_path(bucket, path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{bucket}/{path}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn backend(dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::open(dir.path(), b"secret".to_vec()).await.unwrap()
    }

    #[tokio::test]
    async fn tokens_are_hmac_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBackend::open(dir.path(), b"test-secret".to_vec()).await.unwrap();
        assert_eq!(
            store.sign("routines", "s1/1_plan.pdf", 1_700_000_000).unwrap(),
            "784d767174b69da11c3c63f112f80606a61ed3861ee31831970f0acf4c2df35b"
        );
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;

        let row = store
            .insert("routines", json!({ "nombre": "Plan" }))
            .await
            .unwrap();

        assert!(row["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(row["created_at"].is_string());
    }

    #[tokio::test]
    async fn rows_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = backend(&dir).await;
            store
                .insert(USERS, json!({ "id": "u1", "username": "ana" }))
                .await
                .unwrap();
        }

        let store = backend(&dir).await;
        let rows = store.select(&Query::table(USERS)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["username"], "ana");
    }

    #[tokio::test]
    async fn unique_username_is_enforced_on_insert_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        store.insert(USERS, json!({ "id": "u1", "username": "ana" })).await.unwrap();
        store.insert(USERS, json!({ "id": "u2", "username": "bea" })).await.unwrap();

        let duplicate = store.insert(USERS, json!({ "username": "ana" })).await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

        let rename = store
            .update(&Query::table(USERS).eq("id", "u2"), json!({ "username": "ana" }))
            .await;
        assert!(matches!(rename, Err(StoreError::Conflict(_))));

        let rows = store.select(&Query::table(USERS).eq("id", "u2")).await.unwrap();
        assert_eq!(rows[0]["username"], "bea");
    }

    #[tokio::test]
    async fn select_orders_limits_and_projects() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        for (id, date) in [("a", "2024-05-01"), ("b", "2024-05-03"), ("c", "2024-05-02")] {
            store
                .insert(ATTENDANCES, json!({ "id": id, "student_id": id, "date": date }))
                .await
                .unwrap();
        }

        let query = Query::table(ATTENDANCES)
            .select(&["id", "date"])
            .order("date", Order::Desc)
            .limit(2);
        let rows = store.select(&query).await.unwrap();

        assert_eq!(rows, vec![
            json!({ "id": "b", "date": "2024-05-03" }),
            json!({ "id": "c", "date": "2024-05-02" }),
        ]);
    }

    #[tokio::test]
    async fn upsert_merges_on_conflict_column() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;

        store
            .upsert(PUSH_SUBSCRIPTIONS, json!({ "user_id": "u1", "subscription": { "endpoint": "a" } }), "user_id")
            .await
            .unwrap();
        store
            .upsert(PUSH_SUBSCRIPTIONS, json!({ "user_id": "u1", "subscription": { "endpoint": "b" } }), "user_id")
            .await
            .unwrap();

        let rows = store.select(&Query::table(PUSH_SUBSCRIPTIONS)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["subscription"]["endpoint"], "b");
    }

    #[tokio::test]
    async fn delete_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        store.insert(ROUTINES_TABLE, json!({ "id": "r1", "gym_id": "g" })).await.unwrap();
        store.insert(ROUTINES_TABLE, json!({ "id": "r2", "gym_id": "g" })).await.unwrap();

        let gym = Query::table(ROUTINES_TABLE).eq("gym_id", "g");
        assert_eq!(store.count(&gym).await.unwrap(), 2);
        assert_eq!(store.delete(&Query::table(ROUTINES_TABLE).eq("id", "r1")).await.unwrap(), 1);
        assert_eq!(store.count(&gym).await.unwrap(), 1);
    }

    const ROUTINES_TABLE: &str = "routines";

    #[tokio::test]
    async fn signed_urls_round_trip_and_reject_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        store
            .upload("routines", "s1/1_plan.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
            .await
            .unwrap();

        let url = store.signed_url("routines", "s1/1_plan.pdf", 3600).await.unwrap();
        assert!(url.starts_with("/storage/routines/s1/1_plan.pdf?expires="));

        let params: HashMap<String, String> = url
            .split_once('?')
            .unwrap()
            .1
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let expires: i64 = params["expires"].parse().unwrap();

        let bytes = store
            .open_signed("routines", "s1/1_plan.pdf", expires, &params["token"])
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.4");

        let tampered = store
            .open_signed("routines", "s1/1_plan.pdf", expires + 60, &params["token"])
            .await;
        assert!(matches!(tampered, Err(StoreError::InvalidSignature)));
    }

    #[tokio::test]
    async fn expired_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        let expires = Utc::now().timestamp() - 1;
        let token = store.sign("routines", "a.pdf", expires).unwrap();

        let result = store.open_signed("routines", "a.pdf", expires, &token).await;
        assert!(matches!(result, Err(StoreError::InvalidSignature)));
    }

    #[tokio::test]
    async fn object_paths_cannot_escape_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;

        let result = store
            .upload("routines", "../tables/users.json", b"{}".to_vec(), "application/json")
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn removing_missing_objects_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir).await;
        store.remove("routines", &["nope.pdf".to_string()]).await.unwrap();
    }
}
