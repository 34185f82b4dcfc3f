//! SQLite Binding Store
//!
//! Persists bindings in a single `router_bindings` table. Deleted bindings are
//! kept: `deleted` is set to the row's own id, which frees the
//! `(object_id, deleted)` unique constraint for a new active binding.

use crate::domain::ports::{Binding, BindingStore, BindingUpdate, NewBinding, ResourceMetadata};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS router_bindings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_metadata TEXT,
    resource_descriptor TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    deleted_at TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    CONSTRAINT router_bindings_uniq UNIQUE (object_id, deleted)
)
"#;

const CREATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_router_bindings_object_id ON router_bindings (object_id)";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the binding store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection URL, e.g. `sqlite:/var/lib/router-broker/bindings.db`
    pub database_url: String,
    /// Pool size; forced to 1 for in-memory databases
    pub max_connections: u32,
    /// Upper bound for a single store operation in seconds
    pub query_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            query_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct BindingRow {
    id: i64,
    object_id: String,
    resource_type: String,
    resource_id: String,
    resource_metadata: Option<String>,
    resource_descriptor: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    deleted: i64,
}

impl TryFrom<BindingRow> for Binding {
    type Error = Error;

    fn try_from(row: BindingRow) -> Result<Self> {
        let resource_metadata = row
            .resource_metadata
            .as_deref()
            .map(serde_json::from_str::<ResourceMetadata>)
            .transpose()?;

        Ok(Binding {
            id: row.id,
            object_id: row.object_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            resource_metadata,
            resource_descriptor: row.resource_descriptor,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            deleted: row.deleted,
        })
    }
}

fn encode_metadata(metadata: &Option<ResourceMetadata>) -> Result<Option<String>> {
    Ok(metadata.as_ref().map(serde_json::to_string).transpose()?)
}

fn map_insert_error(err: sqlx::Error, object_id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Error::DuplicateBinding {
            object_id: object_id.to_string(),
        },
        _ => Error::Database(err),
    }
}

// =============================================================================
// SQLite Binding Store
// =============================================================================

/// Binding store on top of an sqlx SQLite pool
pub struct SqliteBindingStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteBindingStore {
    /// Connect and run migrations
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let max_connections = if config.is_in_memory() {
            1
        } else {
            config.max_connections.max(1)
        };

        // An in-memory database lives only as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(config.query_timeout_secs.max(1)))
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        };
        store.migrate().await?;

        info!("Binding store ready at {}", config.database_url);

        Ok(store)
    }

    /// Private in-memory store
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreConfig::default()).await
    }

    /// Create the bindings table if missing
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Every row ever written for `object_id`, deleted ones included, oldest first
    pub async fn history(&self, object_id: &str) -> Result<Vec<Binding>> {
        self.timed("binding_history", async {
            let rows = sqlx::query_as::<_, BindingRow>(
                "SELECT * FROM router_bindings WHERE object_id = ? ORDER BY id",
            )
            .bind(object_id)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(Binding::try_from).collect::<Result<Vec<_>>>()
        })
        .await
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                duration: self.query_timeout,
            })?
    }

    async fn fetch_active(
        conn: &mut sqlx::SqliteConnection,
        object_id: &str,
    ) -> Result<Option<BindingRow>> {
        Ok(sqlx::query_as::<_, BindingRow>(
            "SELECT * FROM router_bindings WHERE object_id = ? AND deleted = 0",
        )
        .bind(object_id)
        .fetch_optional(conn)
        .await?)
    }
}

#[async_trait]
impl BindingStore for SqliteBindingStore {
    async fn add(&self, binding: NewBinding) -> Result<Binding> {
        self.timed("binding_add", async {
            let metadata = encode_metadata(&binding.resource_metadata)?;
            let mut tx = self.pool.begin().await?;

            let id = sqlx::query(
                "INSERT INTO router_bindings \
                 (object_id, resource_type, resource_id, resource_metadata, resource_descriptor, created_at, deleted) \
                 VALUES (?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(&binding.object_id)
            .bind(&binding.resource_type)
            .bind(&binding.resource_id)
            .bind(metadata)
            .bind(&binding.resource_descriptor)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, &binding.object_id))?
            .last_insert_rowid();

            let row = sqlx::query_as::<_, BindingRow>("SELECT * FROM router_bindings WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;
            debug!(
                "Bound {} to {} on {}",
                binding.object_id, binding.resource_id, binding.resource_descriptor
            );

            Binding::try_from(row)
        })
        .await
    }

    async fn get(&self, object_id: &str) -> Result<Binding> {
        self.timed("binding_get", async {
            let mut conn = self.pool.acquire().await?;
            let row = Self::fetch_active(&mut conn, object_id)
                .await?
                .ok_or_else(|| Error::WrongObjectId {
                    object_id: object_id.to_string(),
                })?;
            Binding::try_from(row)
        })
        .await
    }

    async fn update(&self, object_id: &str, update: BindingUpdate) -> Result<Binding> {
        self.timed("binding_update", async {
            let mut tx = self.pool.begin().await?;

            let row = Self::fetch_active(&mut tx, object_id)
                .await?
                .ok_or_else(|| Error::WrongObjectId {
                    object_id: object_id.to_string(),
                })?;

            let mut binding = Binding::try_from(row)?;
            update.apply_to(&mut binding);
            binding.updated_at = Some(Utc::now());

            sqlx::query(
                "UPDATE router_bindings SET resource_type = ?, resource_id = ?, \
                 resource_metadata = ?, resource_descriptor = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&binding.resource_type)
            .bind(&binding.resource_id)
            .bind(encode_metadata(&binding.resource_metadata)?)
            .bind(&binding.resource_descriptor)
            .bind(binding.updated_at)
            .bind(binding.id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<_, Error>(binding)
        })
        .await
    }

    async fn delete(&self, object_id: &str) -> Result<()> {
        self.timed("binding_delete", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                "UPDATE router_bindings SET deleted = id, deleted_at = ?, updated_at = ? \
                 WHERE object_id = ? AND deleted = 0",
            )
            .bind(now)
            .bind(now)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(Error::WrongObjectId {
                    object_id: object_id.to_string(),
                });
            }

            tx.commit().await?;
            debug!("Soft-deleted binding for {}", object_id);
            Ok::<_, Error>(())
        })
        .await
    }

    async fn list_by_type(&self, resource_type: &str) -> Result<Vec<String>> {
        self.timed("binding_list_by_type", async {
            Ok::<_, Error>(sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT resource_descriptor FROM router_bindings \
                 WHERE resource_type = ? AND deleted = 0 ORDER BY resource_descriptor",
            )
            .bind(resource_type)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.timed("health_check", async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<_, Error>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    fn new_binding(object_id: &str) -> NewBinding {
        NewBinding {
            object_id: object_id.into(),
            resource_type: "fake-resource-type".into(),
            resource_id: "fake-resource-id".into(),
            resource_metadata: None,
            resource_descriptor: "com.vyatta.vm".into(),
        }
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let store = SqliteBindingStore::in_memory().await.unwrap();

        let added = store.add(new_binding("fake-object-id")).await.unwrap();
        assert!(added.is_active());
        assert_eq!(added.deleted, 0);

        let fetched = store.get("fake-object-id").await.unwrap();
        assert_eq!(fetched, added);
    }

    #[tokio::test]
    async fn test_add_duplicate() {
        let store = SqliteBindingStore::in_memory().await.unwrap();
        store.add(new_binding("fake-object-id")).await.unwrap();

        let err = store.add(new_binding("fake-object-id")).await.unwrap_err();
        assert_matches!(err, Error::DuplicateBinding { object_id } if object_id == "fake-object-id");
    }

    #[tokio::test]
    async fn test_get_unknown_object() {
        let store = SqliteBindingStore::in_memory().await.unwrap();
        store.add(new_binding("fake-object-id")).await.unwrap();

        let err = store.get("fake-object-id-2").await.unwrap_err();
        assert_matches!(err, Error::WrongObjectId { .. });
    }

    #[tokio::test]
    async fn test_update_merges_permitted_fields() {
        let store = SqliteBindingStore::in_memory().await.unwrap();
        let original = store.add(new_binding("fake-object-id")).await.unwrap();

        let update = BindingUpdate {
            resource_descriptor: Some("fake-resource-descriptor".into()),
            resource_metadata: Some(ResourceMetadata::from([(
                "instance_ip".to_string(),
                json!("10.0.0.1"),
            )])),
            ..Default::default()
        };
        let updated = store.update("fake-object-id", update).await.unwrap();

        assert_eq!(updated.resource_descriptor, "fake-resource-descriptor");
        assert_eq!(updated.resource_id, original.resource_id);
        assert!(updated.updated_at.is_some());

        let fetched = store.get("fake-object-id").await.unwrap();
        assert_eq!(fetched.resource_descriptor, "fake-resource-descriptor");
        assert_eq!(
            fetched.resource_metadata.unwrap().get("instance_ip"),
            Some(&json!("10.0.0.1"))
        );
    }

    #[tokio::test]
    async fn test_get_fails_after_delete() {
        let store = SqliteBindingStore::in_memory().await.unwrap();
        store.add(new_binding("fake-object-id")).await.unwrap();

        store.delete("fake-object-id").await.unwrap();

        let err = store.get("fake-object-id").await.unwrap_err();
        assert_matches!(err, Error::WrongObjectId { .. });

        let err = store.delete("fake-object-id").await.unwrap_err();
        assert_matches!(err, Error::WrongObjectId { .. });
    }

    #[tokio::test]
    async fn test_add_after_delete_keeps_history() {
        let store = SqliteBindingStore::in_memory().await.unwrap();
        let first = store.add(new_binding("fake-object-id")).await.unwrap();

        store.delete("fake-object-id").await.unwrap();
        let second = store.add(new_binding("fake-object-id")).await.unwrap();
        assert_eq!(second.object_id, "fake-object-id");
        assert_ne!(second.id, first.id);

        let history = store.history("fake-object-id").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].deleted, first.id);
        assert!(history[0].deleted_at.is_some());
        assert!(history[1].is_active());
    }

    #[tokio::test]
    async fn test_list_by_type_is_distinct_and_skips_deleted() {
        let store = SqliteBindingStore::in_memory().await.unwrap();

        for (object_id, descriptor) in [("r1", "backend-a"), ("r2", "backend-a"), ("r3", "backend-b")] {
            let mut binding = new_binding(object_id);
            binding.resource_type = "router".into();
            binding.resource_descriptor = descriptor.into();
            store.add(binding).await.unwrap();
        }

        let descriptors = store.list_by_type("router").await.unwrap();
        assert_eq!(descriptors, vec!["backend-a", "backend-b"]);

        store.delete("r3").await.unwrap();
        let descriptors = store.list_by_type("router").await.unwrap();
        assert_eq!(descriptors, vec!["backend-a"]);

        assert!(store.list_by_type("network").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_for_same_object() {
        let store = Arc::new(SqliteBindingStore::in_memory().await.unwrap());

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.add(new_binding("r1")).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.add(new_binding("r1")).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.history("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_url: format!("sqlite:{}", dir.path().join("bindings.db").display()),
            ..Default::default()
        };

        let store = SqliteBindingStore::connect(&config).await.unwrap();
        store.add(new_binding("r1")).await.unwrap();
        store.close().await;

        let reopened = SqliteBindingStore::connect(&config).await.unwrap();
        let binding = reopened.get("r1").await.unwrap();
        assert_eq!(binding.resource_descriptor, "com.vyatta.vm");
        reopened.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_store_times_out() {
        let mut store = SqliteBindingStore::in_memory().await.unwrap();
        store.query_timeout = Duration::from_millis(200);

        // Hold the only connection so the next call cannot get one
        let held = store.pool.acquire().await.unwrap();

        let err = store.get("r1").await.unwrap_err();
        assert!(err.is_connectivity());
        assert_matches!(err, Error::Timeout { ref operation, .. } if operation == "binding_get");

        drop(held);
        assert_matches!(store.get("r1").await, Err(Error::WrongObjectId { .. }));
    }
}
